//! Contracts between stacked layers.
//!
//! A layer receives commands from the layer above through [`LayerCommands`]
//! and reports to it through [`LayerObserver`]. Each layer owns the layer
//! below and keeps only a weak reference to its observer, so dropping the top
//! of the stack releases everything.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::CommError;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Establishment in progress
    Connecting,
    /// Handshake complete, messages flow
    Connected,
    /// Closing requested
    Disconnecting,
    /// Idle
    Disconnected,
}

impl ConnectionState {
    /// Whether `connect()` is accepted in this state
    pub fn allows_connect(self) -> bool {
        self == ConnectionState::Disconnected
    }

    /// Whether `disconnect()` is accepted in this state
    pub fn allows_disconnect(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Commands a layer accepts from the layer above
#[async_trait]
pub trait LayerCommands<T: Send + 'static>: Send + Sync {
    /// Start establishing the link
    async fn connect(&self);

    /// Close the link; the observer is told with a plain disconnection
    async fn disconnect(&self);

    /// Close the link; the observer is told the disconnection was caused by `cause`
    async fn disconnect_with_error(&self, cause: CommError);

    /// Send one unit
    async fn send(&self, message: T);
}

/// Notifications a layer delivers to the layer above
#[async_trait]
pub trait LayerObserver<T: Send + 'static>: Send + Sync {
    /// The link below is established
    async fn connected(&self);

    /// The link below was closed on request
    async fn disconnected(&self);

    /// The link below was closed because of `cause`
    async fn disconnected_with_error(&self, cause: CommError);

    /// A failure that did not close the link
    async fn error(&self, cause: CommError);

    /// One unit arrived
    async fn receive(&self, message: T);
}

/// Weak handle to an observer, tolerant of the observer being gone
pub(crate) struct ObserverRef<T: Send + 'static>(Weak<dyn LayerObserver<T>>);

impl<T: Send + 'static> ObserverRef<T> {
    pub(crate) fn new(observer: Weak<dyn LayerObserver<T>>) -> Self {
        Self(observer)
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn LayerObserver<T>>> {
        self.0.upgrade()
    }

    pub(crate) async fn connected(&self) {
        if let Some(observer) = self.get() {
            observer.connected().await;
        }
    }

    pub(crate) async fn disconnected(&self) {
        if let Some(observer) = self.get() {
            observer.disconnected().await;
        }
    }

    pub(crate) async fn disconnected_with_error(&self, cause: CommError) {
        if let Some(observer) = self.get() {
            observer.disconnected_with_error(cause).await;
        }
    }

    pub(crate) async fn error(&self, cause: CommError) {
        if let Some(observer) = self.get() {
            observer.error(cause).await;
        }
    }

    pub(crate) async fn receive(&self, message: T) {
        if let Some(observer) = self.get() {
            observer.receive(message).await;
        }
    }
}

impl<T: Send + 'static> Clone for ObserverRef<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
