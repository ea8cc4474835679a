//! Message layer: sequence numbering, envelope codec and acknowledgements.
//!
//! Outgoing messages without a sequence number get the next one from the
//! generator. With acknowledgements enabled every non-AK message received is
//! confirmed with an AK carrying its sequence number, and every message sent
//! is tracked until the peer confirms it.

mod ack;

pub use ack::AckSettings;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

use link_wire::{Message, MessageCodec, SequenceGenerator, SequenceNumber, TextCodec};

use crate::config::ConnectionContext;
use crate::error::{CommError, ErrorKind};
use crate::layer::{LayerCommands, LayerObserver, ObserverRef};
use crate::rfc1006::Rfc1006Layer;

use ack::{AckController, AckObserver};

/// Typed messages over the RFC1006 layer
pub struct MessageLayer {
    context: Arc<ConnectionContext>,
    observer: ObserverRef<Message>,
    lower: Arc<dyn LayerCommands<Bytes>>,
    codec: Arc<dyn MessageCodec>,
    sequence: SequenceGenerator,
    ack: Option<Arc<AckController>>,
}

impl MessageLayer {
    /// Create the layer and the stack below it, using the text envelope
    pub fn new(context: Arc<ConnectionContext>, observer: Weak<dyn LayerObserver<Message>>) -> Arc<Self> {
        Self::with_codec(context, observer, Arc::new(TextCodec))
    }

    /// Create the layer with a custom envelope codec
    pub fn with_codec(
        context: Arc<ConnectionContext>,
        observer: Weak<dyn LayerObserver<Message>>,
        codec: Arc<dyn MessageCodec>,
    ) -> Arc<Self> {
        Self::with_settings(context, observer, codec, AckSettings::default())
    }

    pub(crate) fn with_settings(
        context: Arc<ConnectionContext>,
        observer: Weak<dyn LayerObserver<Message>>,
        codec: Arc<dyn MessageCodec>,
        ack_settings: AckSettings,
    ) -> Arc<Self> {
        let rfc_context = context.clone();
        Self::with_lower(context, observer, codec, ack_settings, move |me| {
            Rfc1006Layer::new(rfc_context, me) as Arc<dyn LayerCommands<Bytes>>
        })
    }

    pub(crate) fn with_lower<F>(
        context: Arc<ConnectionContext>,
        observer: Weak<dyn LayerObserver<Message>>,
        codec: Arc<dyn MessageCodec>,
        ack_settings: AckSettings,
        make_lower: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<dyn LayerObserver<Bytes>>) -> Arc<dyn LayerCommands<Bytes>>,
    {
        Arc::new_cyclic(|me: &Weak<MessageLayer>| {
            let as_observer: Weak<dyn LayerObserver<Bytes>> = me.clone();
            let as_ack_observer: Weak<dyn AckObserver> = me.clone();
            let ack = context
                .ak_enabled
                .then(|| AckController::new(ack_settings, as_ack_observer));
            Self {
                observer: ObserverRef::new(observer),
                lower: make_lower(as_observer),
                codec,
                sequence: SequenceGenerator::new(),
                ack,
                context,
            }
        })
    }

    fn encode(&self, message: &Message) -> Result<Bytes, CommError> {
        self.codec.encode(message).map_err(|e| {
            CommError::new(ErrorKind::Encode, "cannot encode message")
                .with_arg("message", message)
                .with_cause(CommError::from(e))
        })
    }

    /// Confirm a received message; the AK itself is not tracked
    async fn acknowledge(&self, confirmed: SequenceNumber) {
        let ack = Message::ack(confirmed);
        match self.encode(&ack) {
            Ok(payload) => {
                trace!("Acknowledging {} on {}", confirmed, self.context);
                self.lower.send(payload).await;
            }
            Err(cause) => {
                error!("Cannot acknowledge {} on {}: {}", confirmed, self.context, cause);
                self.observer.error(cause).await;
            }
        }
    }

    async fn stop_ack(&self) {
        if let Some(ack) = &self.ack {
            ack.stop().await;
        }
    }
}

#[async_trait]
impl LayerCommands<Message> for MessageLayer {
    async fn connect(&self) {
        self.lower.connect().await;
    }

    async fn disconnect(&self) {
        self.lower.disconnect().await;
    }

    async fn disconnect_with_error(&self, cause: CommError) {
        self.lower.disconnect_with_error(cause).await;
    }

    async fn send(&self, mut message: Message) {
        if !message.sequence_number().is_defined() {
            message.set_sequence_number(self.sequence.next());
        }

        if let Some(ack) = &self.ack {
            if !message.is_ack() {
                ack.message_sent(message.sequence_number(), message.clone()).await;
            }
        }

        match self.encode(&message) {
            Ok(payload) => {
                debug!("Sending {} on {}", message, self.context);
                self.lower.send(payload).await;
            }
            Err(cause) => {
                error!("Cannot send {} on {}: {}", message, self.context, cause);
                self.observer.error(cause).await;
            }
        }
    }
}

#[async_trait]
impl LayerObserver<Bytes> for MessageLayer {
    async fn connected(&self) {
        if let Some(ack) = &self.ack {
            ack.start();
        }
        self.observer.connected().await;
    }

    async fn disconnected(&self) {
        self.stop_ack().await;
        self.observer.disconnected().await;
    }

    async fn disconnected_with_error(&self, cause: CommError) {
        self.stop_ack().await;
        self.observer.disconnected_with_error(cause).await;
    }

    async fn error(&self, cause: CommError) {
        self.observer.error(cause).await;
    }

    async fn receive(&self, payload: Bytes) {
        let message = match self.codec.decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping unparsable payload on {}: {}",
                    self.context,
                    String::from_utf8_lossy(&payload)
                );
                let cause = CommError::new(ErrorKind::ParseMessage, "cannot parse received message")
                    .with_arg("payload", String::from_utf8_lossy(&payload))
                    .with_cause(CommError::from(e));
                self.observer.error(cause).await;
                return;
            }
        };
        debug!("Received {} on {}", message, self.context);

        let Some(ack) = &self.ack else {
            self.observer.receive(message).await;
            return;
        };

        if message.is_ack() {
            if let Some(confirmed) = message.confirmed_sequence_number() {
                ack.receive_ack(confirmed).await;
            }
            return;
        }

        let confirmed = message.sequence_number();
        self.observer.receive(message).await;
        if confirmed.is_defined() {
            self.acknowledge(confirmed).await;
        } else {
            warn!("Not acknowledging unnumbered message on {}", self.context);
        }
    }
}

#[async_trait]
impl AckObserver for MessageLayer {
    async fn resend_message(&self, message: Message) {
        LayerCommands::send(self, message).await;
    }

    async fn ack_failure(&self, key: SequenceNumber, message: Message) {
        let cause = CommError::new(ErrorKind::AkFailure, "message was never acknowledged")
            .with_arg("sequence_number", key)
            .with_arg("message", message);
        self.lower.disconnect_with_error(cause).await;
    }
}
