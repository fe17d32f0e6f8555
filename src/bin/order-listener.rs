use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use order_push_service::config;
use order_push_service::event_handler;
use order_push_service::models::ChangeBatch;
use order_push_service::order_listener;
use order_push_service::state::AppState;
use order_push_service::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    telemetry::init();

    tracing::info!("Starting order listener...");

    let settings = config::Settings::new()?;
    tracing::info!("Configuration loaded successfully");

    let app_state = match AppState::new(settings).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            tracing::error!("Error initializing Firebase clients. Is the service account key configured? {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Application state initialized (Firestore, FCM)");

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let (batch_tx, batch_rx) =
        tokio::sync::mpsc::channel::<ChangeBatch>(app_state.settings.listener.channel_capacity);

    let state_listener = Arc::clone(&app_state);
    let token_listener = token.clone();
    tracker.spawn(async move {
        // The subscription is not re-established after a failure.
        if let Err(e) = order_listener::run(state_listener, batch_tx, token_listener).await {
            tracing::error!("Order listener failed: {}", e);
        }
        tracing::info!("Order listener task finished.");
    });

    let dispatcher = event_handler::listener_dispatcher(Arc::clone(&app_state));
    let token_event = token.clone();
    tracker.spawn(async move {
        if let Err(e) = event_handler::run(dispatcher, batch_rx, token_event).await {
            tracing::error!("Event handler failed: {}", e);
        }
        tracing::info!("Event handler task finished.");
    });
    tracing::info!("Order listener running");

    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down services...");

    token.cancel();
    tracker.close();
    tracker.wait().await;

    tracing::info!("Order listener stopped.");
    Ok(())
}
