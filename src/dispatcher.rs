use crate::{
    models::{ChangeKind, DocumentChange},
    notifier::PipelineOutcome,
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::debug;

type ChangeHandler = Arc<dyn Fn(DocumentChange) -> BoxFuture<'static, PipelineOutcome> + Send + Sync>;

/// Routes document changes to the handlers registered for their kind.
///
/// Each handler invocation runs as its own task, so a slow lookup or send
/// for one order never holds up the next.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: HashMap<ChangeKind, Vec<ChangeHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, kind: ChangeKind, handler: F) -> &mut Self
    where
        F: Fn(DocumentChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipelineOutcome> + Send + 'static,
    {
        let handler: ChangeHandler =
            Arc::new(move |change| -> BoxFuture<'static, PipelineOutcome> { Box::pin(handler(change)) });
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    pub fn handles(&self, kind: ChangeKind) -> bool {
        self.handlers.get(&kind).is_some_and(|h| !h.is_empty())
    }

    /// Spawns every handler registered for `change.kind` on `tracker`.
    ///
    /// Returns no handles when nothing is registered for the kind.
    pub fn dispatch(
        &self,
        change: DocumentChange,
        tracker: &TaskTracker,
    ) -> Vec<JoinHandle<PipelineOutcome>> {
        let Some(handlers) = self.handlers.get(&change.kind).filter(|h| !h.is_empty()) else {
            debug!(id = %change.id, kind = %change.kind, "Ignoring change with no registered handler");
            return Vec::new();
        };

        handlers
            .iter()
            .map(|handler| tracker.spawn(handler(change.clone())))
            .collect()
    }

    /// Dispatches and waits for every handler to finish.
    pub async fn dispatch_and_wait(&self, change: DocumentChange) -> Vec<PipelineOutcome> {
        let kind = change.kind;
        if !self.handles(kind) {
            debug!(id = %change.id, kind = %kind, "Ignoring change with no registered handler");
            return vec![PipelineOutcome::Skipped(kind)];
        }

        let tracker = TaskTracker::new();
        let handles = self.dispatch(change, &tracker);
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(PipelineOutcome::Failed(format!("handler task failed: {}", e))),
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn change(kind: ChangeKind, id: &str) -> DocumentChange {
        DocumentChange {
            kind,
            id: id.to_string(),
            fields: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_only_registered_kind_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = EventDispatcher::new();
        let counter = calls.clone();
        dispatcher.register(ChangeKind::Added, move |change| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                PipelineOutcome::Dispatched {
                    receipt: change.id,
                }
            }
        });

        let added = dispatcher.dispatch_and_wait(change(ChangeKind::Added, "o1")).await;
        let modified = dispatcher
            .dispatch_and_wait(change(ChangeKind::Modified, "o1"))
            .await;
        let removed = dispatcher
            .dispatch_and_wait(change(ChangeKind::Removed, "o1"))
            .await;

        assert_eq!(
            added,
            vec![PipelineOutcome::Dispatched {
                receipt: "o1".to_string()
            }]
        );
        assert_eq!(modified, vec![PipelineOutcome::Skipped(ChangeKind::Modified)]);
        assert_eq!(removed, vec![PipelineOutcome::Skipped(ChangeKind::Removed)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_spawns_on_tracker() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(ChangeKind::Added, |_| async {
            PipelineOutcome::Failed("nope".to_string())
        });
        let tracker = TaskTracker::new();

        let handles = dispatcher.dispatch(change(ChangeKind::Added, "o1"), &tracker);
        assert_eq!(handles.len(), 1);
        assert!(dispatcher
            .dispatch(change(ChangeKind::Removed, "o1"), &tracker)
            .is_empty());

        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());
    }
}
