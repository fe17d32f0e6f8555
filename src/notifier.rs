//! The per-order notification pipeline shared by both deployments:
//! resolve the farmer's push token, build the payload, send it.
//!
//! `notify_new_order` never returns an error. Every way an event can end is
//! a `PipelineOutcome`, and lookup or gateway failures are logged there.

use crate::{
    document_store::{DocumentStore, StoreError},
    fcm_sender::token_prefix,
    models::{ChangeKind, FarmerProfile, FcmNotification, FcmPayload, Order},
    state::AppState,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{error, info, instrument, warn};

pub const NOTIFICATION_TITLE: &str = "New Order Received! 🚜";
pub const BUYER_PLACEHOLDER: &str = "a buyer";
pub const CLICK_ACTION: &str = "FLUTTER_NOTIFICATION_CLICK";

/// Which deployment a payload is built for. The trigger adds client routing
/// and Android delivery hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStyle {
    Listener,
    Trigger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    MissingFarmerId,
    ProfileNotFound { farmer_id: String },
    MissingPushToken { farmer_id: String },
    StaleOrder { age_secs: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// The change was not an insertion.
    Skipped(ChangeKind),
    Aborted(AbortReason),
    Dispatched { receipt: String },
    /// Lookup or send failed; the error has been logged.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Token(String),
    Abort(AbortReason),
}

/// Looks up the farmer's profile and extracts a usable push token.
pub async fn resolve_recipient(
    store: &dyn DocumentStore,
    users_collection: &str,
    farmer_id: Option<&str>,
) -> Result<Resolution, StoreError> {
    let Some(farmer_id) = farmer_id.filter(|id| !id.is_empty()) else {
        return Ok(Resolution::Abort(AbortReason::MissingFarmerId));
    };

    let Some(fields) = store.get_document(users_collection, farmer_id).await? else {
        return Ok(Resolution::Abort(AbortReason::ProfileNotFound {
            farmer_id: farmer_id.to_string(),
        }));
    };

    match FarmerProfile::from_fields(&fields).push_token() {
        Some(token) => Ok(Resolution::Token(token.to_string())),
        None => Ok(Resolution::Abort(AbortReason::MissingPushToken {
            farmer_id: farmer_id.to_string(),
        })),
    }
}

/// Renders an amount the way it reads in the notification: whole numbers
/// without a fractional part.
pub fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 && amount.abs() < 1e15 {
        format!("{}", amount as i64)
    } else {
        format!("{}", amount)
    }
}

pub fn notification_body(order: &Order) -> String {
    let buyer = order
        .buyer_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(BUYER_PLACEHOLDER);
    let amount = format_amount(order.total_amount.unwrap_or(0.0));
    format!("You have a new order from {} for ₹{}.", buyer, amount)
}

pub fn build_order_payload(
    order_id: &str,
    order: &Order,
    style: PayloadStyle,
    android_channel_id: &str,
) -> FcmPayload {
    let mut data = HashMap::new();
    data.insert("type".to_string(), "order".to_string());
    data.insert("orderId".to_string(), order_id.to_string());

    let android = match style {
        PayloadStyle::Listener => None,
        PayloadStyle::Trigger => {
            data.insert("click_action".to_string(), CLICK_ACTION.to_string());
            Some(serde_json::json!({
                "priority": "high",
                "notification": { "channel_id": android_channel_id }
            }))
        }
    };

    FcmPayload {
        notification: Some(FcmNotification {
            title: Some(NOTIFICATION_TITLE.to_string()),
            body: Some(notification_body(order)),
        }),
        data: Some(data),
        android,
    }
}

/// Age of the order in seconds if it exceeds `max_age_secs`.
pub fn stale_age(order: &Order, max_age_secs: u64, now: DateTime<Utc>) -> Option<i64> {
    let created_at = order.created_at?;
    let age = (now - created_at).num_seconds();
    (age > max_age_secs as i64).then_some(age)
}

/// Runs the whole pipeline for one newly created order.
#[instrument(skip(state, order))]
pub async fn notify_new_order(
    state: &AppState,
    order_id: &str,
    order: &Order,
    style: PayloadStyle,
) -> PipelineOutcome {
    let farmer_id = order.farmer_id.as_deref().unwrap_or_default();
    info!(order_id, farmer_id, "New order detected");

    if style == PayloadStyle::Listener {
        if let Some(max_age) = state.settings.listener.max_order_age_secs {
            if let Some(age_secs) = stale_age(order, max_age, Utc::now()) {
                info!(order_id, age_secs, "Order predates the listener window, not notifying");
                return PipelineOutcome::Aborted(AbortReason::StaleOrder { age_secs });
            }
        }
    }

    let resolution = resolve_recipient(
        state.store.as_ref(),
        &state.settings.collections.users,
        order.farmer_id.as_deref(),
    )
    .await;

    let token = match resolution {
        Ok(Resolution::Token(token)) => token,
        Ok(Resolution::Abort(reason)) => {
            match &reason {
                AbortReason::MissingFarmerId => warn!(order_id, "No farmerId in order"),
                AbortReason::ProfileNotFound { farmer_id } => {
                    warn!(order_id, farmer_id = %farmer_id, "Farmer user document not found")
                }
                AbortReason::MissingPushToken { farmer_id } => {
                    warn!(order_id, farmer_id = %farmer_id, "No FCM token found in farmer profile")
                }
                AbortReason::StaleOrder { .. } => {}
            }
            return PipelineOutcome::Aborted(reason);
        }
        Err(e) => {
            error!(order_id, farmer_id, error = %e, "Failed to look up farmer profile");
            return PipelineOutcome::Failed(e.to_string());
        }
    };

    let payload = build_order_payload(
        order_id,
        order,
        style,
        &state.settings.notification.android_channel_id,
    );

    match state.fcm_client.send_single(&token, payload).await {
        Ok(receipt) => {
            info!(order_id, receipt = %receipt, "Notification sent successfully");
            PipelineOutcome::Dispatched { receipt }
        }
        Err(e) => {
            error!(
                order_id,
                token_prefix = token_prefix(&token),
                error = ?e,
                "Error sending notification"
            );
            PipelineOutcome::Failed(e.to_string())
        }
    }
}
