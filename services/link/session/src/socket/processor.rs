//! Queue-fed worker decoupling producers from the socket.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Consumer of the items queued on a [`MessageProcessor`]
#[async_trait]
pub(crate) trait MessageSink<T>: Send + Sync {
    async fn process(&self, item: T);
}

/// FIFO queue drained by a dedicated task.
///
/// Stopping discards whatever is still queued; the item being processed runs
/// to completion. Dropping the processor closes the queue and ends the task.
pub(crate) struct MessageProcessor<T> {
    name: String,
    item_tx: mpsc::UnboundedSender<T>,
    stopped: Arc<AtomicBool>,
}

impl<T: Send + 'static> MessageProcessor<T> {
    pub(crate) fn start(name: String, sink: Arc<dyn MessageSink<T>>) -> Self {
        let (item_tx, mut item_rx) = mpsc::unbounded_channel::<T>();
        let stopped = Arc::new(AtomicBool::new(false));

        let task_stopped = stopped.clone();
        let task_name = name.clone();
        tokio::spawn(async move {
            debug!("{} processor started", task_name);
            while let Some(item) = item_rx.recv().await {
                if task_stopped.load(Ordering::SeqCst) {
                    break;
                }
                sink.process(item).await;
            }
            debug!("{} processor ended", task_name);
        });

        Self {
            name,
            item_tx,
            stopped,
        }
    }

    /// Queue an item; false once stopped
    pub(crate) fn add_message(&self, item: T) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("{} processor stopped, item discarded", self.name);
            return false;
        }
        self.item_tx.send(item).is_ok()
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
