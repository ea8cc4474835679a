//! Socket layer: the bottom of the stack.
//!
//! Owns the socket pair of the current connection attempt and two queue-fed
//! workers. The Tx worker writes outbound TPKTs to the pair; the Rx worker
//! hands the connection notification and received bytes to the layer above,
//! in arrival order and outside the socket event loop.

mod channel;
mod processor;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

use crate::config::ConnectionContext;
use crate::error::{CommError, ErrorKind};
use crate::layer::{LayerCommands, LayerObserver, ObserverRef};
use crate::notifier::lock;

use channel::ChannelHandler;
use processor::{MessageProcessor, MessageSink};

/// Unit handed to the Rx worker
enum Inbound {
    Connected,
    Data(Bytes),
}

struct Processors {
    sender: MessageProcessor<Bytes>,
    receiver: MessageProcessor<Inbound>,
}

impl Processors {
    fn stop(&self) {
        self.sender.stop();
        self.receiver.stop();
    }
}

/// Dual-channel TCP transport
pub struct SocketLayer {
    context: Arc<ConnectionContext>,
    observer: ObserverRef<Bytes>,
    channel: Mutex<Option<Arc<ChannelHandler>>>,
    processors: Mutex<Option<Processors>>,
    me: Weak<SocketLayer>,
}

impl SocketLayer {
    /// Create the layer; `observer` receives connection events and raw bytes
    pub fn new(context: Arc<ConnectionContext>, observer: Weak<dyn LayerObserver<Bytes>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            context,
            observer: ObserverRef::new(observer),
            channel: Mutex::new(None),
            processors: Mutex::new(None),
            me: me.clone(),
        })
    }

    fn stop_processors(&self) {
        if let Some(processors) = lock(&self.processors).take() {
            processors.stop();
            debug!("Tx/Rx processors of {} stopped", self.context);
        }
    }

    fn enqueue_inbound(&self, inbound: Inbound) {
        let queued = lock(&self.processors)
            .as_ref()
            .map_or(false, |processors| processors.receiver.add_message(inbound));
        if !queued {
            debug!("Inbound event for {} discarded, link is closing", self.context);
        }
    }

    async fn close(&self, cause: Option<CommError>) {
        let channel = lock(&self.channel).clone();
        if let Some(channel) = channel.filter(|channel| channel.is_active()) {
            if !channel.disconnect(cause).await {
                debug!("Channel of {} closed concurrently", self.context);
            } else if channel.was_interrupted() {
                debug!("Connection attempt of {} interrupted", self.context);
            }
            return;
        }

        // Nothing open: complete the disconnection for the layers above
        debug!("No open channel for {}, reporting disconnection", self.context);
        match cause {
            Some(cause) => self.disconnected_with_error(cause).await,
            None => self.disconnected().await,
        }
    }
}

#[async_trait]
impl LayerCommands<Bytes> for SocketLayer {
    async fn connect(&self) {
        let observer: Weak<dyn LayerObserver<Bytes>> = self.me.clone();
        let handler = ChannelHandler::new(self.context.clone(), observer);

        let started = {
            let mut channel = lock(&self.channel);
            if channel.as_ref().map_or(false, |current| current.is_active()) {
                false
            } else {
                *channel = Some(handler.clone());
                true
            }
        };
        if !started {
            warn!("Connection attempt of {} already running", self.context);
            self.observer
                .error(CommError::new(
                    ErrorKind::ConnectionError,
                    "a connection attempt is already running",
                ))
                .await;
            return;
        }

        self.stop_processors();
        let sender = MessageProcessor::start(
            format!("Tx {}", self.context.name),
            Arc::new(ChannelSender {
                channel: handler.clone(),
                observer: self.observer.clone(),
            }),
        );
        let receiver = MessageProcessor::start(
            format!("Rx {}", self.context.name),
            Arc::new(InboundDispatcher {
                observer: self.observer.clone(),
            }),
        );
        *lock(&self.processors) = Some(Processors { sender, receiver });

        info!("Opening socket pair for {}", self.context);
        handler.connect();
    }

    async fn disconnect(&self) {
        self.close(None).await;
    }

    async fn disconnect_with_error(&self, cause: CommError) {
        self.close(Some(cause)).await;
    }

    async fn send(&self, data: Bytes) {
        let queued = lock(&self.processors)
            .as_ref()
            .map_or(false, |processors| processors.sender.add_message(data));
        if !queued {
            self.observer
                .error(CommError::new(ErrorKind::Sending, "no open channel to send on"))
                .await;
        }
    }
}

/// Notifications coming from the channel handler
#[async_trait]
impl LayerObserver<Bytes> for SocketLayer {
    async fn connected(&self) {
        self.enqueue_inbound(Inbound::Connected);
    }

    async fn disconnected(&self) {
        self.stop_processors();
        self.observer.disconnected().await;
    }

    async fn disconnected_with_error(&self, cause: CommError) {
        self.stop_processors();
        self.observer.disconnected_with_error(cause).await;
    }

    async fn error(&self, cause: CommError) {
        self.observer.error(cause).await;
    }

    async fn receive(&self, data: Bytes) {
        self.enqueue_inbound(Inbound::Data(data));
    }
}

struct ChannelSender {
    channel: Arc<ChannelHandler>,
    observer: ObserverRef<Bytes>,
}

#[async_trait]
impl MessageSink<Bytes> for ChannelSender {
    async fn process(&self, data: Bytes) {
        if let Err(e) = self.channel.send(data).await {
            if self.channel.is_active() {
                warn!("Send failed: {}", e);
                self.observer
                    .error(CommError::new(ErrorKind::Sending, "cannot write to the channel").with_cause(e))
                    .await;
            } else {
                debug!("Send dropped, channel closed: {}", e);
            }
        }
    }
}

struct InboundDispatcher {
    observer: ObserverRef<Bytes>,
}

#[async_trait]
impl MessageSink<Inbound> for InboundDispatcher {
    async fn process(&self, inbound: Inbound) {
        match inbound {
            Inbound::Connected => self.observer.connected().await,
            Inbound::Data(data) => self.observer.receive(data).await,
        }
    }
}
