use crate::{
    dispatcher::EventDispatcher,
    error::Result,
    models::{ChangeBatch, ChangeKind, Order},
    notifier::{self, PayloadStyle},
    state::AppState,
};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// The standing listener's routing: only inserted orders are notified.
pub fn listener_dispatcher(state: Arc<AppState>) -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(ChangeKind::Added, move |change| {
        let state = Arc::clone(&state);
        async move {
            let order = Order::from_fields(&change.fields);
            notifier::notify_new_order(&state, &change.id, &order, PayloadStyle::Listener).await
        }
    });
    dispatcher
}

/// Consumes change batches and starts one pipeline per routed change.
///
/// Pipelines run concurrently; on shutdown the handler stops taking batches
/// and waits for the ones already in flight.
pub async fn run(
    dispatcher: EventDispatcher,
    mut batch_rx: Receiver<ChangeBatch>,
    token: CancellationToken,
) -> Result<()> {
    info!("Starting event handler...");
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Event handler cancellation received. Shutting down...");
                break;
            }

            maybe_batch = batch_rx.recv() => {
                let Some(batch) = maybe_batch else {
                    info!("Change channel closed. Event handler shutting down.");
                    break;
                };

                debug!(changes = batch.len(), "Event handler received batch");
                for change in batch {
                    dispatcher.dispatch(change, &tracker);
                }
            }
        }
    }

    tracker.close();
    if !tracker.is_empty() {
        info!(in_flight = tracker.len(), "Waiting for in-flight notifications...");
    }
    tracker.wait().await;

    info!("Event handler shut down.");
    Ok(())
}
