//! order_push_service Library Crate
//!
//! Sends a push notification to a farmer whenever a new order document is
//! created. The `order-listener` binary watches the orders collection; the
//! `order-trigger` binary is invoked by the hosting platform once per
//! created document. Both run the pipeline in [`notifier`].

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod document_store;
pub mod error;
pub mod event_handler;
pub mod fcm_sender;
pub mod models;
pub mod notifier;
pub mod order_listener;
pub mod state;
pub mod telemetry;
pub mod trigger;
