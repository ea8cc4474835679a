//! Acknowledgement tracking with retransmission.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use link_wire::{Message, SequenceNumber};

use crate::notifier::lock;

/// Retry timing of the acknowledgement tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckSettings {
    /// Age after which an unacknowledged message is due
    pub timeout: Duration,
    /// Transmissions allowed before the failure is declared
    pub max_attempts: u32,
    /// Period of the pending-message scan
    pub check_interval: Duration,
}

impl Default for AckSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            max_attempts: 3,
            check_interval: Duration::from_millis(200),
        }
    }
}

/// Callbacks of the retry task
#[async_trait]
pub(crate) trait AckObserver: Send + Sync {
    /// Transmit `message` again, keeping its sequence number
    async fn resend_message(&self, message: Message);

    /// `message` was never acknowledged
    async fn ack_failure(&self, key: SequenceNumber, message: Message);
}

#[derive(Debug, Clone)]
struct PendingAck {
    message: Message,
    /// Number of transmissions so far
    attempts: u32,
    last_sent: Instant,
}

/// Outcome of one scan over the pending messages
#[derive(Debug, Default)]
struct ScanResult {
    failure: Option<SequenceNumber>,
    resend: Vec<SequenceNumber>,
    grace: Vec<SequenceNumber>,
}

struct RetryTask {
    handle: JoinHandle<()>,
    stopped: Arc<AtomicBool>,
}

/// Tracks messages awaiting acknowledgement
pub(crate) struct AckController {
    pending: Arc<RwLock<HashMap<SequenceNumber, PendingAck>>>,
    settings: AckSettings,
    observer: Weak<dyn AckObserver>,
    task: Mutex<Option<RetryTask>>,
}

impl AckController {
    pub(crate) fn new(settings: AckSettings, observer: Weak<dyn AckObserver>) -> Arc<Self> {
        Arc::new(Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            settings,
            observer,
            task: Mutex::new(None),
        })
    }

    /// Record a transmission of `message` under `key`
    pub(crate) async fn message_sent(&self, key: SequenceNumber, message: Message) {
        let mut pending = self.pending.write().await;
        let item = pending.entry(key).or_insert_with(|| PendingAck {
            message,
            attempts: 0,
            last_sent: Instant::now(),
        });
        item.attempts += 1;
        debug!("Message {} pending acknowledgement (attempt {})", key, item.attempts);
    }

    /// Drop the pending message confirmed by an acknowledgement
    pub(crate) async fn receive_ack(&self, key: SequenceNumber) {
        match self.pending.write().await.remove(&key) {
            Some(item) => debug!("Message {} acknowledged after {} attempt(s)", key, item.attempts),
            None => warn!("Acknowledgement for unknown message {}", key),
        }
    }

    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Start the periodic scan; no-op when already running
    pub(crate) fn start(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let task_stopped = stopped.clone();
        let controller = Arc::downgrade(self);
        let period = self.settings.check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if task_stopped.load(Ordering::SeqCst) {
                    break;
                }
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.check_pending().await;
            }
            debug!("Acknowledgement retry task ended");
        });

        *task = Some(RetryTask { handle, stopped });
        info!("Acknowledgement retry task started");
    }

    /// Stop the periodic scan and forget every pending message
    pub(crate) async fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.stopped.store(true, Ordering::SeqCst);
            // The task may be the caller itself; it exits on its next tick
            drop(task.handle);
            info!("Acknowledgement retry task stopped");
        }

        let mut pending = self.pending.write().await;
        if !pending.is_empty() {
            debug!("Discarding {} unacknowledged message(s)", pending.len());
            pending.clear();
        }
    }

    fn is_stopped(&self) -> bool {
        lock(&self.task).is_none()
    }

    /// Decide, under the read lock, what each due message needs
    async fn scan(&self) -> ScanResult {
        let pending = self.pending.read().await;
        let now = Instant::now();
        let mut result = ScanResult::default();

        for (key, item) in pending.iter() {
            if now.duration_since(item.last_sent) <= self.settings.timeout {
                continue;
            }
            if item.attempts > self.settings.max_attempts {
                result.failure.get_or_insert(*key);
            } else if item.attempts != self.settings.max_attempts {
                result.resend.push(*key);
            } else {
                result.grace.push(*key);
            }
        }
        result
    }

    async fn check_pending(&self) {
        let scan = self.scan().await;
        let Some(observer) = self.observer.upgrade() else {
            return;
        };

        // Grace counts advance on every tick, the failing one included
        if !scan.grace.is_empty() {
            let mut pending = self.pending.write().await;
            for key in &scan.grace {
                if let Some(item) = pending.get_mut(key) {
                    item.attempts += 1;
                }
            }
        }

        if let Some(key) = scan.failure {
            let removed = self.pending.write().await.remove(&key);
            if let Some(item) = removed {
                error!(
                    "Message {} not acknowledged after {} attempt(s)",
                    key, item.attempts
                );
                observer.ack_failure(key, item.message).await;
            }
            return;
        }

        for key in scan.resend {
            if self.is_stopped() {
                return;
            }
            let message = self.pending.read().await.get(&key).map(|item| item.message.clone());
            let Some(message) = message else {
                continue;
            };

            warn!("No acknowledgement for message {}, resending", key);
            observer.resend_message(message).await;

            if let Some(item) = self.pending.write().await.get_mut(&key) {
                item.last_sent = Instant::now();
            }
        }
    }
}
