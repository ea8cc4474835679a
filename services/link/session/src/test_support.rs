//! Helpers shared by the unit tests of this crate.

use async_trait::async_trait;
use std::net::TcpListener as StdTcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use link_wire::Message;

use crate::config::ConnectionContext;
use crate::error::CommError;
use crate::layer::{LayerCommands, LayerObserver};
use crate::notifier::ConnectionListener;

/// Event seen by a [`RecordingListener`] or a [`RecordingObserver`]
#[derive(Debug, Clone)]
pub enum Recorded {
    Connected,
    Disconnected,
    DisconnectedWithError(CommError),
    Error(CommError),
    Received(Message),
    Bytes(bytes::Bytes),
}

/// Listener forwarding every callback into a channel
#[derive(Debug)]
pub struct RecordingListener {
    tx: mpsc::UnboundedSender<Recorded>,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Recorded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl ConnectionListener for RecordingListener {
    fn connected(&self, _context: &ConnectionContext) {
        let _ = self.tx.send(Recorded::Connected);
    }

    fn disconnected(&self, _context: &ConnectionContext) {
        let _ = self.tx.send(Recorded::Disconnected);
    }

    fn error(&self, _context: &ConnectionContext, error: &CommError) {
        let _ = self.tx.send(Recorded::Error(error.clone()));
    }

    fn received(&self, _context: &ConnectionContext, message: Message) {
        let _ = self.tx.send(Recorded::Received(message));
    }
}

/// Layer observer forwarding every notification into a channel
pub struct RecordingObserver<T> {
    tx: mpsc::UnboundedSender<Recorded>,
    wrap: fn(T) -> Recorded,
}

impl<T> RecordingObserver<T> {
    pub fn new(wrap: fn(T) -> Recorded) -> (Arc<Self>, mpsc::UnboundedReceiver<Recorded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, wrap }), rx)
    }
}

#[async_trait]
impl<T: Send + 'static> LayerObserver<T> for RecordingObserver<T> {
    async fn connected(&self) {
        let _ = self.tx.send(Recorded::Connected);
    }

    async fn disconnected(&self) {
        let _ = self.tx.send(Recorded::Disconnected);
    }

    async fn disconnected_with_error(&self, cause: CommError) {
        let _ = self.tx.send(Recorded::DisconnectedWithError(cause));
    }

    async fn error(&self, cause: CommError) {
        let _ = self.tx.send(Recorded::Error(cause));
    }

    async fn receive(&self, message: T) {
        let _ = self.tx.send((self.wrap)(message));
    }
}

/// Command issued to a [`MockLower`]
#[derive(Debug, Clone, PartialEq)]
pub enum Command<T> {
    Connect,
    Disconnect,
    DisconnectWithError(CommError),
    Send(T),
}

/// Lower layer that only records the commands it gets
pub struct MockLower<T> {
    pub commands: Mutex<Vec<Command<T>>>,
}

impl<T> MockLower<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
        })
    }
}

impl<T: Clone> MockLower<T> {
    pub fn commands(&self) -> Vec<Command<T>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<T> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                Command::Send(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl<T: Send + 'static> LayerCommands<T> for MockLower<T> {
    async fn connect(&self) {
        self.commands.lock().unwrap().push(Command::Connect);
    }

    async fn disconnect(&self) {
        self.commands.lock().unwrap().push(Command::Disconnect);
    }

    async fn disconnect_with_error(&self, cause: CommError) {
        self.commands
            .lock()
            .unwrap()
            .push(Command::DisconnectWithError(cause));
    }

    async fn send(&self, message: T) {
        self.commands.lock().unwrap().push(Command::Send(message));
    }
}

/// A loopback port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for the next recorded event
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Wait until an event matching `pred` shows up, skipping the others
pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<Recorded>, pred: F) -> Recorded
where
    F: Fn(&Recorded) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}
