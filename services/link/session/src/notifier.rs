//! Ordered, asynchronous delivery of connection events to the listener.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use link_wire::Message;

use crate::config::ConnectionContext;
use crate::error::CommError;

/// Receives the events of one connection.
///
/// Calls are made from a dedicated task, one at a time, in the order the
/// events were raised.
pub trait ConnectionListener: Send + Sync + fmt::Debug {
    /// The link is established
    fn connected(&self, context: &ConnectionContext);
    /// The link is closed
    fn disconnected(&self, context: &ConnectionContext);
    /// Something went wrong
    fn error(&self, context: &ConnectionContext, error: &CommError);
    /// A message arrived
    fn received(&self, context: &ConnectionContext, message: Message);
}

/// Event raised by the connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Link established
    Connected,
    /// Link closed
    Disconnected,
    /// Error to report
    Error(CommError),
    /// Message received from the peer
    MessageReceived(Message),
}

struct Worker {
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    handle: JoinHandle<()>,
}

/// Event notifier for one connection
pub struct EventNotifier {
    context: Arc<ConnectionContext>,
    listener: Arc<dyn ConnectionListener>,
    /// Running worker, if any
    worker: Mutex<Option<Worker>>,
    /// Stopped worker still draining its queue
    draining: Mutex<Option<JoinHandle<()>>>,
}

impl EventNotifier {
    /// Create a stopped notifier
    pub fn new(context: Arc<ConnectionContext>, listener: Arc<dyn ConnectionListener>) -> Self {
        Self {
            context,
            listener,
            worker: Mutex::new(None),
            draining: Mutex::new(None),
        }
    }

    /// Start the delivery task; no-op when already running
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return;
        }

        let previous = lock(&self.draining).take();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::process_events(
            self.context.clone(),
            self.listener.clone(),
            event_rx,
            previous,
        ));
        *worker = Some(Worker { event_tx, handle });
    }

    /// Stop accepting events; already queued events are still delivered
    pub fn stop(&self) {
        if let Some(worker) = lock(&self.worker).take() {
            drop(worker.event_tx);
            *lock(&self.draining) = Some(worker.handle);
            debug!("Event notifier for {} stopped", self.context);
        }
    }

    /// Whether events are currently accepted
    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Queue an event for delivery
    pub fn add_event(&self, event: ConnectionEvent) {
        let worker = lock(&self.worker);
        let Some(worker) = worker.as_ref() else {
            error!(
                "Event notifier for {} is stopped, dropping event {:?}",
                self.context, event
            );
            return;
        };

        if let Err(e) = worker.event_tx.send(event) {
            error!("Failed to queue event for {}: {:?}", self.context, e.0);
        }
    }

    async fn process_events(
        context: Arc<ConnectionContext>,
        listener: Arc<dyn ConnectionListener>,
        mut event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        previous: Option<JoinHandle<()>>,
    ) {
        // Events of an earlier run go out first
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        info!("Starting event processor for {}", context);
        while let Some(event) = event_rx.recv().await {
            debug!("Delivering {:?} for {}", event, context);
            match event {
                ConnectionEvent::Connected => listener.connected(&context),
                ConnectionEvent::Disconnected => listener.disconnected(&context),
                ConnectionEvent::Error(err) => listener.error(&context, &err),
                ConnectionEvent::MessageReceived(message) => listener.received(&context, message),
            }
        }
        info!("Event processor for {} ended", context);
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("context", &self.context.name)
            .field("running", &self.is_running())
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionMode;
    use crate::error::ErrorKind;
    use crate::test_support::{Recorded, RecordingListener};
    use link_wire::MessageType;
    use std::time::Duration;
    use tokio::time::timeout;

    fn notifier() -> (EventNotifier, mpsc::UnboundedReceiver<Recorded>) {
        let (listener, rx) = RecordingListener::new();
        let context = Arc::new(ConnectionContext::new(ConnectionMode::Client, "A", "B"));
        (EventNotifier::new(context, listener), rx)
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (notifier, mut rx) = notifier();
        notifier.start();

        let message = Message::new(MessageType::new("PR").unwrap(), "1");
        notifier.add_event(ConnectionEvent::Connected);
        notifier.add_event(ConnectionEvent::MessageReceived(message.clone()));
        notifier.add_event(ConnectionEvent::Error(CommError::new(ErrorKind::Timeout, "late")));
        notifier.add_event(ConnectionEvent::Disconnected);
        notifier.stop();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }

        assert!(matches!(received[0], Recorded::Connected));
        assert!(matches!(&received[1], Recorded::Received(m) if *m == message));
        assert!(matches!(&received[2], Recorded::Error(e) if e.kind() == ErrorKind::Timeout));
        assert!(matches!(received[3], Recorded::Disconnected));
    }

    #[tokio::test]
    async fn test_stopped_notifier_drops_events() {
        let (notifier, mut rx) = notifier();
        assert!(!notifier.is_running());
        notifier.add_event(ConnectionEvent::Connected);

        notifier.start();
        assert!(notifier.is_running());
        notifier.add_event(ConnectionEvent::Disconnected);

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(first, Recorded::Disconnected));
    }

    #[tokio::test]
    async fn test_restart_keeps_order() {
        let (notifier, mut rx) = notifier();

        notifier.start();
        notifier.add_event(ConnectionEvent::Connected);
        notifier.add_event(ConnectionEvent::Disconnected);
        notifier.stop();
        notifier.start();
        notifier.start();
        notifier.add_event(ConnectionEvent::Connected);

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }
        assert!(matches!(received[0], Recorded::Connected));
        assert!(matches!(received[1], Recorded::Disconnected));
        assert!(matches!(received[2], Recorded::Connected));
    }
}
