use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use order_push_service::config;
use order_push_service::state::AppState;
use order_push_service::telemetry;
use order_push_service::trigger::{self, TriggerRegistration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    telemetry::init();

    tracing::info!("Starting order trigger...");

    let settings = config::Settings::new()?;
    let registration = TriggerRegistration::on_create(&settings.server.trigger_pattern)?;
    tracing::info!("Configuration loaded successfully");

    // Credentials come from the platform unless a service account is configured.
    let app_state = Arc::new(AppState::for_trigger(settings).await?);
    tracing::info!("Application state initialized (Firestore, FCM)");

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let token_server = token.clone();
    tracker.spawn(async move {
        if let Err(e) = trigger::run_server(app_state, registration, token_server.clone()).await {
            tracing::error!("Trigger server error: {}", e);
            token_server.cancel();
        }
        tracing::info!("Trigger server task finished.");
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = token.cancelled() => {
            tracing::info!("Shutdown triggered by server failure");
        }
    }

    token.cancel();
    tracker.close();
    tracker.wait().await;

    tracing::info!("Order trigger stopped.");
    Ok(())
}
