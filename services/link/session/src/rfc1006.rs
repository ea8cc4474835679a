//! RFC1006 transport layer.
//!
//! Wraps upper-layer payloads in DT TSDUs, reassembles TPKTs from the byte
//! stream and runs the CR/CC handshake. The link is established once both
//! the CR and CC flags are set:
//!
//! - client: sends CR when the socket pair opens, then waits for a CC with
//!   matching TSAPs until the connection timeout (counted from `connect`) runs out
//! - server: waits for a CR with matching TSAPs and answers with CC

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use link_wire::{encode_connection, encode_data, TpktDecoder, Tsaps, Tsdu, TsduCode, WireError};

use crate::config::ConnectionContext;
use crate::error::{CommError, ErrorKind};
use crate::layer::{LayerCommands, LayerObserver, ObserverRef};
use crate::notifier::lock;
use crate::socket::SocketLayer;

/// Poll period of the CC waiter
pub const CC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// TPKT/TSDU layer with handshake
pub struct Rfc1006Layer {
    context: Arc<ConnectionContext>,
    observer: ObserverRef<Bytes>,
    lower: Arc<dyn LayerCommands<Bytes>>,
    decoder: Mutex<TpktDecoder>,
    flag_cr: AtomicBool,
    flag_cc: AtomicBool,
    /// Bumped on every reset so stale CC waiters can tell
    session: AtomicU64,
    tsaps: Mutex<Option<Tsaps>>,
    connect_started: Mutex<Instant>,
    send_lock: tokio::sync::Mutex<()>,
    me: Weak<Rfc1006Layer>,
}

impl Rfc1006Layer {
    /// Create the layer on top of a socket layer
    pub fn new(context: Arc<ConnectionContext>, observer: Weak<dyn LayerObserver<Bytes>>) -> Arc<Self> {
        let socket_context = context.clone();
        Self::with_lower(context, observer, move |me| {
            SocketLayer::new(socket_context, me) as Arc<dyn LayerCommands<Bytes>>
        })
    }

    pub(crate) fn with_lower<F>(
        context: Arc<ConnectionContext>,
        observer: Weak<dyn LayerObserver<Bytes>>,
        make_lower: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<dyn LayerObserver<Bytes>>) -> Arc<dyn LayerCommands<Bytes>>,
    {
        Arc::new_cyclic(|me: &Weak<Rfc1006Layer>| {
            let as_observer: Weak<dyn LayerObserver<Bytes>> = me.clone();
            Self {
                context,
                observer: ObserverRef::new(observer),
                lower: make_lower(as_observer),
                decoder: Mutex::new(TpktDecoder::new()),
                flag_cr: AtomicBool::new(false),
                flag_cc: AtomicBool::new(false),
                session: AtomicU64::new(0),
                tsaps: Mutex::new(None),
                connect_started: Mutex::new(Instant::now()),
                send_lock: tokio::sync::Mutex::new(()),
                me: me.clone(),
            }
        })
    }

    /// Both handshake flags are set
    pub fn is_established(&self) -> bool {
        self.flag_cr.load(Ordering::SeqCst) && self.flag_cc.load(Ordering::SeqCst)
    }

    fn connection_reset(&self) {
        self.flag_cr.store(false, Ordering::SeqCst);
        self.flag_cc.store(false, Ordering::SeqCst);
        self.session.fetch_add(1, Ordering::SeqCst);
        lock(&self.decoder).clear();
    }

    async fn write_tpkt(&self, tpkt: Bytes) {
        let _guard = self.send_lock.lock().await;
        self.lower.send(tpkt).await;
    }

    async fn connection_request(&self) {
        if self.flag_cr.swap(true, Ordering::SeqCst) {
            debug!("CR already sent for {}", self.context);
            return;
        }

        let Some(tsaps) = lock(&self.tsaps).clone() else {
            return;
        };
        match encode_connection(TsduCode::ConnectionRequest, &tsaps) {
            Ok(tpkt) => {
                info!("Sending CR for {}", self.context);
                self.write_tpkt(tpkt).await;
                self.wait_for_cc();
            }
            Err(e) => {
                error!("Cannot build CR for {}: {}", self.context, e);
                self.connection_reset();
                self.lower.disconnect_with_error(CommError::from(e)).await;
            }
        }
    }

    fn wait_for_cc(&self) {
        let me = self.me.clone();
        let session = self.session.load(Ordering::SeqCst);
        let started = *lock(&self.connect_started);
        let budget = self.context.timeout;

        tokio::spawn(async move {
            loop {
                let Some(layer) = me.upgrade() else {
                    return;
                };
                if layer.session.load(Ordering::SeqCst) != session {
                    debug!("CC waiter of {} outlived its session", layer.context);
                    return;
                }
                if layer.is_established() {
                    return;
                }

                let remaining = budget.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    warn!("No CC received for {} within {:?}", layer.context, budget);
                    layer.connection_reset();
                    let cause = CommError::new(ErrorKind::Timeout, "connection confirm not received")
                        .with_arg("timeout_millis", budget.as_millis());
                    layer.lower.disconnect_with_error(cause).await;
                    return;
                }
                drop(layer);
                sleep(CC_POLL_INTERVAL.min(remaining)).await;
            }
        });
    }

    /// Compare received TSAPs with the configured ones; a mismatch closes the link
    async fn check_tsaps(&self, received: &Tsaps) -> bool {
        let Some(expected) = lock(&self.tsaps).clone() else {
            return false;
        };

        let mismatch = if received.calling != expected.calling {
            Some(("calling", &expected.calling, &received.calling))
        } else if received.called != expected.called {
            Some(("called", &expected.called, &received.called))
        } else {
            None
        };

        let Some((parameter, expected_value, received_value)) = mismatch else {
            return true;
        };

        let cause = CommError::new(ErrorKind::Tsaps, "peer TSAPs do not match the configuration")
            .with_arg("parameter", parameter)
            .with_arg("expected", tsap_text(expected_value))
            .with_arg("received", tsap_text(received_value));
        error!("TSAP check failed for {}: {:?}", self.context, cause.args());
        // The socket pair stays open; the peer times out or a new connect replaces it
        self.connection_reset();
        self.observer.disconnected_with_error(cause).await;
        false
    }

    async fn receive_cr(&self, tsaps: Tsaps) {
        if self.context.is_client() {
            debug!("Ignoring CR received by client {}", self.context);
            return;
        }
        if self.is_established() {
            debug!("Ignoring CR on established link {}", self.context);
            return;
        }
        if !self.check_tsaps(&tsaps).await {
            return;
        }

        if !self.flag_cr.swap(true, Ordering::SeqCst) && !self.flag_cc.swap(true, Ordering::SeqCst) {
            let confirm = lock(&self.tsaps)
                .clone()
                .ok_or_else(|| WireError::Tsap("not configured".to_string()))
                .and_then(|tsaps| encode_connection(TsduCode::ConnectionConfirm, &tsaps));
            match confirm {
                Ok(tpkt) => {
                    info!("CR accepted, sending CC for {}", self.context);
                    self.write_tpkt(tpkt).await;
                }
                Err(e) => {
                    error!("Cannot build CC for {}: {}", self.context, e);
                    self.connection_reset();
                    self.lower.disconnect_with_error(CommError::from(e)).await;
                    return;
                }
            }
        }

        if self.is_established() {
            self.observer.connected().await;
        } else {
            self.connection_reset();
        }
    }

    async fn receive_cc(&self, tsaps: Tsaps) {
        if !self.context.is_client() {
            debug!("Ignoring CC received by server {}", self.context);
            return;
        }
        if self.is_established() {
            debug!("Ignoring CC on established link {}", self.context);
            return;
        }
        if !self.flag_cr.load(Ordering::SeqCst) {
            debug!("Ignoring CC without pending CR on {}", self.context);
            return;
        }
        if !self.check_tsaps(&tsaps).await {
            return;
        }

        if !self.flag_cc.swap(true, Ordering::SeqCst) {
            info!("CC received, link {} established", self.context);
            self.observer.connected().await;
        }
    }

    async fn receive_dt(&self, payload: Bytes) {
        if !self.is_established() {
            warn!(
                "Discarding {} byte DT received before the handshake of {}",
                payload.len(),
                self.context
            );
            return;
        }
        self.observer.receive(payload).await;
    }
}

fn tsap_text(tsap: &Option<Bytes>) -> String {
    match tsap {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "null".to_string(),
    }
}

#[async_trait]
impl LayerCommands<Bytes> for Rfc1006Layer {
    async fn connect(&self) {
        *lock(&self.connect_started) = Instant::now();
        self.lower.connect().await;
    }

    async fn disconnect(&self) {
        self.lower.disconnect().await;
    }

    async fn disconnect_with_error(&self, cause: CommError) {
        self.lower.disconnect_with_error(cause).await;
    }

    async fn send(&self, payload: Bytes) {
        match encode_data(&payload) {
            Ok(tpkt) => self.write_tpkt(tpkt).await,
            Err(e) => {
                error!("Cannot frame {} byte payload for {}: {}", payload.len(), self.context, e);
                let cause = CommError::new(ErrorKind::Sending, "payload does not fit a TPKT")
                    .with_cause(CommError::from(e));
                self.observer.error(cause).await;
            }
        }
    }
}

#[async_trait]
impl LayerObserver<Bytes> for Rfc1006Layer {
    async fn connected(&self) {
        let tsaps = match Tsaps::new(&self.context.calling_tsap, &self.context.called_tsap) {
            Ok(tsaps) => tsaps,
            Err(e) => {
                error!("Invalid TSAPs for {}: {}", self.context, e);
                self.lower.disconnect_with_error(CommError::from(e)).await;
                return;
            }
        };
        *lock(&self.tsaps) = Some(tsaps);
        debug!("Socket pair of {} open, starting handshake", self.context);

        if self.context.is_client() {
            self.connection_request().await;
        }
    }

    async fn disconnected(&self) {
        self.connection_reset();
        self.observer.disconnected().await;
    }

    async fn disconnected_with_error(&self, cause: CommError) {
        self.connection_reset();
        self.observer.disconnected_with_error(cause).await;
    }

    async fn error(&self, cause: CommError) {
        self.connection_reset();
        self.observer.error(cause).await;
    }

    async fn receive(&self, data: Bytes) {
        let decoded = lock(&self.decoder).feed(&data);

        for tsdu in decoded {
            match tsdu {
                Ok(Tsdu::ConnectionRequest(tsaps)) => self.receive_cr(tsaps).await,
                Ok(Tsdu::ConnectionConfirm(tsaps)) => self.receive_cc(tsaps).await,
                Ok(Tsdu::Data(payload)) => self.receive_dt(payload).await,
                Err(WireError::Type(code)) => {
                    warn!("Unsupported TSDU code {:#04x} on {}", code, self.context)
                }
                Err(e) => {
                    error!("Dropping undecodable input on {}: {}", self.context, e);
                    let cause = CommError::new(ErrorKind::Decode, "cannot decode received bytes")
                        .with_cause(CommError::from(e));
                    self.observer.error(cause).await;
                }
            }
        }
    }
}
