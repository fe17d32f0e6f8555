use crate::{
    document_store::StoredDocument,
    error::Result,
    models::{ChangeBatch, ChangeKind, DocumentChange},
    state::AppState,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Turns successive snapshots of a collection into change batches.
///
/// The first snapshot reports every document as added.
#[derive(Debug, Default)]
pub struct SnapshotDiff {
    known: HashMap<String, StoredDocument>,
}

impl SnapshotDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, snapshot: Vec<StoredDocument>) -> ChangeBatch {
        let mut changes = Vec::new();
        let mut next = HashMap::with_capacity(snapshot.len());

        for document in snapshot {
            let kind = match self.known.remove(&document.id) {
                None => Some(ChangeKind::Added),
                Some(previous) if previous.update_time != document.update_time => {
                    Some(ChangeKind::Modified)
                }
                Some(_) => None,
            };
            if let Some(kind) = kind {
                changes.push(DocumentChange {
                    kind,
                    id: document.id.clone(),
                    fields: document.fields.clone(),
                });
            }
            next.insert(document.id.clone(), document);
        }

        // Whatever was not seen again has been deleted.
        let mut removed: Vec<_> = self.known.drain().collect();
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, document) in removed {
            changes.push(DocumentChange {
                kind: ChangeKind::Removed,
                id,
                fields: document.fields,
            });
        }

        self.known = next;
        changes
    }
}

/// Watches the orders collection and forwards each non-empty change batch.
///
/// A failed snapshot ends the subscription; it is not retried.
pub async fn run(
    state: Arc<AppState>,
    batch_tx: Sender<ChangeBatch>,
    token: CancellationToken,
) -> Result<()> {
    let collection = state.settings.collections.orders.clone();
    let poll_interval = Duration::from_millis(state.settings.listener.poll_interval_ms.max(1));
    info!(collection = %collection, poll_ms = poll_interval.as_millis() as u64, "Listening for new orders...");

    let mut diff = SnapshotDiff::new();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Order listener cancellation received. Shutting down...");
                break;
            }
            _ = ticker.tick() => {}
        }

        let snapshot = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Order listener cancelled during snapshot.");
                break;
            }
            result = state.store.list_documents(&collection) => result,
        };

        let documents = match snapshot {
            Ok(documents) => documents,
            Err(e) => {
                error!(error = %e, "Error in order snapshot listener");
                return Err(e.into());
            }
        };

        let batch = diff.apply(documents);
        if batch.is_empty() {
            continue;
        }
        debug!(changes = batch.len(), "Snapshot produced changes");

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!("Order listener cancelled while forwarding a batch.");
                break;
            }
            send_res = batch_tx.send(batch) => {
                if let Err(e) = send_res {
                    error!("Failed to send change batch to handler channel: {}", e);
                    break;
                }
            }
        }
    }

    info!("Order listener shut down.");
    Ok(())
}
