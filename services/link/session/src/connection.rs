//! Connection handler: the public entry point of a link.
//!
//! Owns the connection state, serializes the commands coming from the
//! application and turns the notifications of the layers below into listener
//! events. A link that was established and is lost for a non-fatal reason is
//! reopened after [`RECONNECT_DELAY`].

use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use link_wire::{Message, MessageCodec, TextCodec};

use crate::config::ConnectionContext;
use crate::error::{CommError, ErrorKind};
use crate::layer::{ConnectionState, LayerCommands, LayerObserver};
use crate::message::MessageLayer;
use crate::notifier::{lock, ConnectionEvent, ConnectionListener, EventNotifier};

/// Pause before reopening a lost link
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A client or server link to one peer
pub struct Connection {
    context: Arc<ConnectionContext>,
    state: Mutex<ConnectionState>,
    /// Serializes connect, disconnect and send; never taken by callbacks
    command_lock: tokio::sync::Mutex<()>,
    notifier: EventNotifier,
    lower: Arc<dyn LayerCommands<Message>>,
    me: Weak<Connection>,
}

impl Connection {
    /// Create a link using the text message envelope
    pub fn new(context: ConnectionContext, listener: Arc<dyn ConnectionListener>) -> Arc<Self> {
        Self::with_codec(context, listener, Arc::new(TextCodec))
    }

    /// Create a link with a custom message codec
    pub fn with_codec(
        context: ConnectionContext,
        listener: Arc<dyn ConnectionListener>,
        codec: Arc<dyn MessageCodec>,
    ) -> Arc<Self> {
        let context = Arc::new(context);
        let layer_context = context.clone();
        Self::with_lower(context, listener, move |me| {
            MessageLayer::with_codec(layer_context, me, codec) as Arc<dyn LayerCommands<Message>>
        })
    }

    pub(crate) fn with_lower<F>(
        context: Arc<ConnectionContext>,
        listener: Arc<dyn ConnectionListener>,
        make_lower: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<dyn LayerObserver<Message>>) -> Arc<dyn LayerCommands<Message>>,
    {
        Arc::new_cyclic(|me: &Weak<Connection>| {
            let as_observer: Weak<dyn LayerObserver<Message>> = me.clone();
            Self {
                notifier: EventNotifier::new(context.clone(), listener),
                state: Mutex::new(ConnectionState::Disconnected),
                command_lock: tokio::sync::Mutex::new(()),
                lower: make_lower(as_observer),
                context,
                me: me.clone(),
            }
        })
    }

    /// Configuration of this link
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Current lifecycle state
    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Start establishing the link; only accepted while disconnected
    pub async fn connect(&self) {
        let _command = self.command_lock.lock().await;

        let current = {
            let mut state = lock(&self.state);
            let current = *state;
            if current.allows_connect() {
                *state = ConnectionState::Connecting;
            }
            current
        };

        if !current.allows_connect() {
            warn!("Connect refused for {} in state {}", self.context, current);
            let err = CommError::new(ErrorKind::ConnectionError, "connect is not allowed in this state")
                .with_arg("state", current);
            // A duplicate connect must not cancel the attempt in flight
            self.notify_error(err, current != ConnectionState::Connecting);
            return;
        }

        info!("Connecting {}", self.context);
        self.notifier.start();
        self.lower.connect().await;
    }

    /// Close the link; accepted while connecting or connected
    pub async fn disconnect(&self) {
        let _command = self.command_lock.lock().await;

        let current = {
            let mut state = lock(&self.state);
            let current = *state;
            if current.allows_disconnect() {
                *state = ConnectionState::Disconnecting;
            }
            current
        };

        if !current.allows_disconnect() {
            warn!("Disconnect refused for {} in state {}", self.context, current);
            let err = CommError::new(
                ErrorKind::DisconnectionError,
                "disconnect is not allowed in this state",
            )
            .with_arg("state", current);
            self.notify_error(err, true);
            return;
        }

        info!("Disconnecting {}", self.context);
        self.lower.disconnect().await;
    }

    /// Send a message to the peer.
    ///
    /// Sending while not connected is reported to the listener but still
    /// attempted. Messages that are not well formed are reported and dropped.
    pub async fn send(&self, message: Message) {
        let _command = self.command_lock.lock().await;

        let state = self.connection_state();
        if state != ConnectionState::Connected {
            warn!("Sending on {} while {}", self.context, state);
            let err = CommError::new(ErrorKind::Sending, "link is not connected")
                .with_arg("state", state)
                .with_arg("message", &message);
            self.notify_error(err, true);
        }

        if let Err(e) = message.validate() {
            error!("Dropping malformed message {} on {}: {}", message, self.context, e);
            let err = CommError::new(ErrorKind::ParseMessage, "message is not well formed")
                .with_arg("message", &message)
                .with_cause(CommError::from(e));
            self.notify_error(err, true);
            return;
        }

        self.lower.send(message).await;
    }

    fn set_state(&self, new_state: ConnectionState) -> ConnectionState {
        let previous = std::mem::replace(&mut *lock(&self.state), new_state);
        if previous != new_state {
            debug!("{}: {} -> {}", self.context, previous, new_state);
        }
        previous
    }

    fn with_connection(&self, err: CommError) -> CommError {
        err.with_arg("connection", &self.context)
    }

    /// Report an error; while connecting or disconnecting it also ends the attempt
    fn notify_error(&self, err: CommError, update_state: bool) {
        if update_state {
            let mut state = lock(&self.state);
            if matches!(
                *state,
                ConnectionState::Connecting | ConnectionState::Disconnecting
            ) {
                debug!("{}: {} -> {} after error", self.context, *state, ConnectionState::Disconnected);
                *state = ConnectionState::Disconnected;
            }
        }
        self.notifier
            .add_event(ConnectionEvent::Error(self.with_connection(err)));
    }

    fn schedule_reconnect(&self) {
        let me = self.me.clone();
        info!("Reconnecting {} in {:?}", self.context, RECONNECT_DELAY);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match me.upgrade() {
                Some(connection) => connection.connect().await,
                None => debug!("Connection dropped before reconnecting"),
            }
        });
    }
}

#[async_trait]
impl LayerObserver<Message> for Connection {
    async fn connected(&self) {
        self.set_state(ConnectionState::Connected);
        info!("Link {} connected", self.context);
        self.notifier.add_event(ConnectionEvent::Connected);
    }

    async fn disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        info!("Link {} disconnected", self.context);
        self.notifier.add_event(ConnectionEvent::Disconnected);
        self.notifier.stop();
    }

    async fn disconnected_with_error(&self, cause: CommError) {
        let previous = self.set_state(ConnectionState::Disconnected);
        let reconnect = previous == ConnectionState::Connected && !cause.is_fatal();
        warn!("Link {} disconnected: {}", self.context, cause);

        self.notifier
            .add_event(ConnectionEvent::Error(self.with_connection(cause)));
        self.notifier.add_event(ConnectionEvent::Disconnected);

        if reconnect {
            self.schedule_reconnect();
        } else {
            self.notifier.stop();
        }
    }

    async fn error(&self, cause: CommError) {
        error!("Communication failure on {}: {}", self.context, cause);
        let err = CommError::new(ErrorKind::CommunicationError, "communication failure").with_cause(cause);
        self.notify_error(err, true);
    }

    async fn receive(&self, message: Message) {
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            let err = CommError::new(ErrorKind::CommunicationError, "message received while not connected")
                .with_arg("state", state)
                .with_arg("message", &message);
            self.notify_error(err, true);
        }
        self.notifier
            .add_event(ConnectionEvent::MessageReceived(message));
    }
}

#[cfg(test)]
impl Connection {
    fn with_ack_settings(
        context: ConnectionContext,
        listener: Arc<dyn ConnectionListener>,
        settings: crate::message::AckSettings,
    ) -> Arc<Self> {
        let context = Arc::new(context);
        let layer_context = context.clone();
        Self::with_lower(context, listener, move |me| {
            MessageLayer::with_settings(layer_context, me, Arc::new(TextCodec), settings)
                as Arc<dyn LayerCommands<Message>>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionMode;
    use crate::message::AckSettings;
    use crate::test_support::{
        free_port, next_event, wait_for, Command, MockLower, Recorded, RecordingListener,
    };
    use link_wire::{MessageType, SequenceNumber};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, Instant};

    fn pr(content: &str) -> Message {
        Message::new(MessageType::new("PR").unwrap(), content)
    }

    fn expect_error(event: Recorded, kind: ErrorKind) -> CommError {
        match event {
            Recorded::Error(err) => {
                assert_eq!(err.kind(), kind, "unexpected error {}", err);
                assert!(err.arg("connection").is_some());
                err
            }
            other => panic!("Expected {} error, got {:?}", kind, other),
        }
    }

    // -- State machine against a recording lower layer --

    struct Mocked {
        connection: Arc<Connection>,
        lower: Arc<MockLower<Message>>,
        events: mpsc::UnboundedReceiver<Recorded>,
    }

    fn mocked() -> Mocked {
        let context = Arc::new(ConnectionContext::new(ConnectionMode::Client, "A", "B"));
        let (listener, events) = RecordingListener::new();
        let lower = MockLower::new();
        let lower_for_layer = lower.clone();
        let connection = Connection::with_lower(context, listener, move |_| {
            lower_for_layer as Arc<dyn LayerCommands<Message>>
        });
        Mocked {
            connection,
            lower,
            events,
        }
    }

    fn connects(lower: &MockLower<Message>) -> usize {
        lower
            .commands()
            .iter()
            .filter(|c| matches!(c, Command::Connect))
            .count()
    }

    #[tokio::test]
    async fn test_connect_only_from_disconnected() {
        let mut m = mocked();

        m.connection.connect().await;
        assert_eq!(m.connection.connection_state(), ConnectionState::Connecting);
        assert_eq!(m.lower.commands(), vec![Command::Connect]);

        // Duplicate connect leaves the attempt alone
        m.connection.connect().await;
        expect_error(next_event(&mut m.events).await, ErrorKind::ConnectionError);
        assert_eq!(m.connection.connection_state(), ConnectionState::Connecting);
        assert_eq!(connects(&m.lower), 1);

        m.connection.connected().await;
        assert!(matches!(next_event(&mut m.events).await, Recorded::Connected));

        m.connection.connect().await;
        expect_error(next_event(&mut m.events).await, ErrorKind::ConnectionError);
        assert_eq!(m.connection.connection_state(), ConnectionState::Connected);
        assert_eq!(connects(&m.lower), 1);
    }

    #[tokio::test]
    async fn test_disconnect_gating() {
        let mut m = mocked();

        m.connection.disconnect().await;
        assert_eq!(m.connection.connection_state(), ConnectionState::Disconnected);
        assert!(m.lower.commands().is_empty());

        m.connection.connect().await;
        m.connection.connected().await;
        m.connection.disconnect().await;
        assert_eq!(m.connection.connection_state(), ConnectionState::Disconnecting);
        assert_eq!(m.lower.commands().last(), Some(&Command::Disconnect));

        // Refused, and the error ends the pending disconnection
        m.connection.disconnect().await;
        assert!(matches!(next_event(&mut m.events).await, Recorded::Connected));
        expect_error(next_event(&mut m.events).await, ErrorKind::DisconnectionError);
        assert_eq!(m.connection.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_not_connected_reports_and_continues() {
        let mut m = mocked();
        m.connection.connect().await;

        m.connection.send(pr("1")).await;

        let err = expect_error(next_event(&mut m.events).await, ErrorKind::Sending);
        assert_eq!(err.arg("state"), Some("CONNECTING"));
        assert_eq!(m.lower.sent(), vec![pr("1")]);
        assert_eq!(m.connection.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_message_dropped() {
        let mut m = mocked();
        m.connection.connect().await;
        m.connection.connected().await;
        assert!(matches!(next_event(&mut m.events).await, Recorded::Connected));

        m.connection.send(pr("not valid")).await;

        let err = expect_error(next_event(&mut m.events).await, ErrorKind::ParseMessage);
        assert_eq!(err.arg("message"), Some("****PRnot valid"));
        assert!(m.lower.sent().is_empty());
        assert_eq!(m.connection.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_receive_while_not_connected_still_delivers() {
        let mut m = mocked();
        m.connection.connect().await;

        m.connection
            .receive(pr("5").with_sequence_number(SequenceNumber::new(5)))
            .await;

        expect_error(next_event(&mut m.events).await, ErrorKind::CommunicationError);
        match next_event(&mut m.events).await {
            Recorded::Received(message) => assert_eq!(message.content(), "5"),
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_layer_error_wrapped_as_communication_error() {
        let mut m = mocked();
        m.connection.connect().await;

        m.connection
            .error(CommError::new(ErrorKind::SocketError, "boom"))
            .await;

        let err = expect_error(next_event(&mut m.events).await, ErrorKind::CommunicationError);
        assert_eq!(err.cause().map(CommError::kind), Some(ErrorKind::SocketError));
        assert_eq!(m.connection.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_reconnects_after_delay() {
        let mut m = mocked();
        m.connection.connect().await;
        m.connection.connected().await;

        m.connection
            .disconnected_with_error(CommError::new(ErrorKind::RemoteDisconnection, "peer left"))
            .await;
        assert_eq!(m.connection.connection_state(), ConnectionState::Disconnected);

        assert!(matches!(next_event(&mut m.events).await, Recorded::Connected));
        expect_error(next_event(&mut m.events).await, ErrorKind::RemoteDisconnection);
        assert!(matches!(next_event(&mut m.events).await, Recorded::Disconnected));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(connects(&m.lower), 1);
        sleep(Duration::from_millis(700)).await;
        assert_eq!(connects(&m.lower), 2);
        assert_eq!(m.connection.connection_state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_after_fatal_error_or_failed_attempt() {
        let m = mocked();
        m.connection.connect().await;
        m.connection.connected().await;

        let fatal = CommError::new(ErrorKind::CommunicationError, "wrapped")
            .with_cause(CommError::new(ErrorKind::AkFailure, "never acknowledged"));
        m.connection.disconnected_with_error(fatal).await;
        sleep(Duration::from_secs(3)).await;
        assert_eq!(connects(&m.lower), 1);

        // Lost while still connecting
        m.connection.connect().await;
        m.connection
            .disconnected_with_error(CommError::new(ErrorKind::Timeout, "no CC"))
            .await;
        sleep(Duration::from_secs(3)).await;
        assert_eq!(connects(&m.lower), 2);
        assert_eq!(m.connection.connection_state(), ConnectionState::Disconnected);
    }

    // -- End to end over loopback sockets --

    struct Peer {
        connection: Arc<Connection>,
        events: mpsc::UnboundedReceiver<Recorded>,
    }

    fn context(mode: ConnectionMode, port: u16, calling: &str, called: &str) -> ConnectionContext {
        ConnectionContext::new(mode, calling, called)
            .with_host("127.0.0.1")
            .with_port(port)
            .with_name(format!("{}", mode).to_lowercase())
            .with_timeout(Duration::from_secs(3))
    }

    fn peer(context: ConnectionContext) -> Peer {
        let (listener, events) = RecordingListener::new();
        Peer {
            connection: Connection::new(context, listener),
            events,
        }
    }

    async fn connected_pair(port: u16, ak_enabled: bool) -> (Peer, Peer) {
        let mut server = peer(context(ConnectionMode::Server, port, "A", "B").with_ak_enabled(ak_enabled));
        let mut client = peer(context(ConnectionMode::Client, port, "A", "B").with_ak_enabled(ak_enabled));

        server.connection.connect().await;
        client.connection.connect().await;

        assert!(matches!(next_event(&mut server.events).await, Recorded::Connected));
        assert!(matches!(next_event(&mut client.events).await, Recorded::Connected));
        (server, client)
    }

    /// Events up to and including the next disconnection
    async fn until_disconnected(events: &mut mpsc::UnboundedReceiver<Recorded>) -> Vec<Recorded> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(events).await;
            let done = matches!(event, Recorded::Disconnected);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (mut server, mut client) = connected_pair(free_port(), true).await;
        assert_eq!(server.connection.connection_state(), ConnectionState::Connected);
        assert_eq!(client.connection.connection_state(), ConnectionState::Connected);

        client.connection.send(pr("12")).await;
        match next_event(&mut server.events).await {
            Recorded::Received(message) => {
                assert_eq!(message.sequence_number(), SequenceNumber::new(1));
                assert_eq!(message.content(), "12");
            }
            other => panic!("Expected message, got {:?}", other),
        }

        server.connection.send(pr("34")).await;
        match next_event(&mut client.events).await {
            Recorded::Received(message) => assert_eq!(message.content(), "34"),
            other => panic!("Expected message, got {:?}", other),
        }

        // Acknowledgements are consumed by the links
        sleep(Duration::from_millis(200)).await;
        assert!(server.events.try_recv().is_err());
        assert!(client.events.try_recv().is_err());

        client.connection.disconnect().await;
        assert!(matches!(next_event(&mut client.events).await, Recorded::Disconnected));
        server.connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_tsap_mismatch_never_connects() {
        let port = free_port();
        let mut server = peer(context(ConnectionMode::Server, port, "A", "B"));
        let mut client = peer(context(ConnectionMode::Client, port, "A", "X"));

        server.connection.connect().await;
        client.connection.connect().await;

        let server_events = until_disconnected(&mut server.events).await;
        let client_events = until_disconnected(&mut client.events).await;

        let tsaps = server_events
            .iter()
            .find_map(|e| match e {
                Recorded::Error(err) => Some(err.clone()),
                _ => None,
            })
            .expect("server reports the mismatch");
        assert_eq!(tsaps.kind(), ErrorKind::Tsaps);
        assert!(tsaps.is_fatal());
        assert_eq!(tsaps.arg("parameter"), Some("called"));

        // The server keeps the pair open, so the client gives up on its own
        let timeout = client_events
            .iter()
            .find_map(|e| match e {
                Recorded::Error(err) => Some(err.clone()),
                _ => None,
            })
            .expect("client reports the missing confirm");
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(!timeout.is_fatal());
        assert!(!client_events
            .iter()
            .any(|e| matches!(e, Recorded::Error(err) if err.has_kind(ErrorKind::RemoteDisconnection))));
        for events in [&server_events, &client_events] {
            assert!(!events.iter().any(|e| matches!(e, Recorded::Connected)));
        }

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(server.connection.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.connection.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_client_times_out_without_confirm() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent_peer = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            let (second, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(10)).await;
            drop((first, second));
        });

        let mut client = peer(
            context(ConnectionMode::Client, port, "A", "B").with_timeout(Duration::from_millis(500)),
        );
        client.connection.connect().await;

        let events = until_disconnected(&mut client.events).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, Recorded::Error(err) if err.kind() == ErrorKind::Timeout)));
        assert_eq!(client.connection.connection_state(), ConnectionState::Disconnected);
        silent_peer.abort();
    }

    #[tokio::test]
    async fn test_unacknowledged_message_fails_the_link() {
        let port = free_port();
        let mut server =
            peer(context(ConnectionMode::Server, port, "A", "B").with_ak_enabled(false));
        let (listener, mut client_events) = RecordingListener::new();
        let settings = AckSettings {
            timeout: Duration::from_millis(300),
            max_attempts: 3,
            check_interval: Duration::from_millis(50),
        };
        let client = Connection::with_ack_settings(
            context(ConnectionMode::Client, port, "A", "B"),
            listener,
            settings,
        );

        server.connection.connect().await;
        client.connect().await;
        assert!(matches!(next_event(&mut server.events).await, Recorded::Connected));
        assert!(matches!(next_event(&mut client_events).await, Recorded::Connected));

        client.send(pr("77")).await;

        let mut arrivals = Vec::new();
        for _ in 0..3 {
            match next_event(&mut server.events).await {
                Recorded::Received(message) => arrivals.push((message, Instant::now())),
                other => panic!("Expected message, got {:?}", other),
            }
        }
        for (message, _) in &arrivals {
            assert_eq!(message.sequence_number(), SequenceNumber::new(1));
            assert_eq!(message.content(), "77");
        }
        for pair in arrivals.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= Duration::from_millis(250));
        }

        let err = expect_error(next_event(&mut client_events).await, ErrorKind::AkFailure);
        assert_eq!(err.arg("sequence_number"), Some("0x0001"));
        assert!(matches!(next_event(&mut client_events).await, Recorded::Disconnected));

        expect_error(
            wait_for(&mut server.events, |e| matches!(e, Recorded::Error(_))).await,
            ErrorKind::RemoteDisconnection,
        );

        // Fatal: the client stays down
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        server.connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_remote_disconnection_triggers_reconnect() {
        let port = free_port();
        let (mut server, mut client) = connected_pair(port, true).await;

        client.connection.disconnect().await;
        assert!(matches!(next_event(&mut client.events).await, Recorded::Disconnected));

        expect_error(next_event(&mut server.events).await, ErrorKind::RemoteDisconnection);
        assert!(matches!(next_event(&mut server.events).await, Recorded::Disconnected));

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(server.connection.connection_state(), ConnectionState::Connecting);

        // The reopened server accepts the client again
        client.connection.connect().await;
        assert!(matches!(next_event(&mut server.events).await, Recorded::Connected));
        assert!(matches!(next_event(&mut client.events).await, Recorded::Connected));

        client.connection.disconnect().await;
        server.connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_oversized_message_reported_not_sent() {
        let (mut server, mut client) = connected_pair(free_port(), false).await;

        client.connection.send(pr(&"1".repeat(116))).await;
        let err = expect_error(next_event(&mut client.events).await, ErrorKind::CommunicationError);
        assert!(err.has_kind(ErrorKind::TpktTooLong));
        assert!(err.is_fatal());

        // 115 characters make a 128 byte TPKT
        client.connection.send(pr(&"2".repeat(115))).await;
        match next_event(&mut server.events).await {
            Recorded::Received(message) => {
                assert_eq!(message.content().len(), 115);
                assert!(message.content().starts_with('2'));
            }
            other => panic!("Expected message, got {:?}", other),
        }
        assert_eq!(client.connection.connection_state(), ConnectionState::Connected);

        client.connection.disconnect().await;
        server.connection.disconnect().await;
    }
}
