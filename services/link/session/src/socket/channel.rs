//! Socket pair of one connection attempt and its event loop.
//!
//! A logical connection uses two TCP streams: the client opens its output
//! channel first and its input channel second; the server accepts its input
//! channel first and its output channel second. One task opens the pair and
//! then runs the readiness loop until the pair is closed.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConnectionContext, ConnectionMode};
use crate::error::{CommError, ErrorKind};
use crate::layer::{LayerObserver, ObserverRef};
use crate::notifier::lock;

/// Read chunk size
pub(crate) const READ_BUFFER_SIZE: usize = 1024;

/// Pause between two client connection attempts
pub(crate) const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Address the server listens on
const LISTEN_ADDRESS: &str = "0.0.0.0";

/// Outbound bytes waiting for the event loop
struct OutputQueue {
    pending: Mutex<BytesMut>,
    /// A flush has been requested and not yet performed
    ready_to_send: AtomicBool,
    write_interest: Notify,
    /// One permit per completed flush; closed with the channel
    flushed: Semaphore,
}

pub(crate) struct ChannelHandler {
    context: Arc<ConnectionContext>,
    observer: ObserverRef<Bytes>,
    output: OutputQueue,
    /// Attempt or loop running and not yet reported as closed
    active: AtomicBool,
    connecting: AtomicBool,
    interrupted: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandler {
    pub(crate) fn new(
        context: Arc<ConnectionContext>,
        observer: Weak<dyn LayerObserver<Bytes>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            observer: ObserverRef::new(observer),
            output: OutputQueue {
                pending: Mutex::new(BytesMut::new()),
                ready_to_send: AtomicBool::new(false),
                write_interest: Notify::new(),
                flushed: Semaphore::new(0),
            },
            active: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    /// Spawn the connection task
    pub(crate) fn connect(self: &Arc<Self>) {
        self.active.store(true, Ordering::SeqCst);
        self.connecting.store(true, Ordering::SeqCst);

        let handler = self.clone();
        let handle = tokio::spawn(async move { handler.run().await });
        *lock(&self.worker) = Some(handle);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the last attempt was cut short by [`ChannelHandler::disconnect`]
    pub(crate) fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Close the pair from outside the connection task.
    ///
    /// Returns false when the pair was already closed; the observer has then
    /// been notified by whoever closed it.
    pub(crate) async fn disconnect(&self, cause: Option<CommError>) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }

        if self.connecting.load(Ordering::SeqCst) {
            info!("Interrupting connection attempt of {}", self.context);
            self.interrupted.store(true, Ordering::SeqCst);
        }
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
        self.output.flushed.close();

        info!("Connection {} closed locally", self.context);
        match cause {
            Some(cause) => self.observer.disconnected_with_error(cause).await,
            None => self.observer.disconnected().await,
        }
        true
    }

    /// Hand bytes to the event loop and wait until they are written
    pub(crate) async fn send(&self, data: Bytes) -> Result<(), CommError> {
        if !self.is_active() {
            return Err(CommError::new(ErrorKind::Sending, "channel is not open"));
        }
        if data.is_empty() {
            return Ok(());
        }

        lock(&self.output.pending).extend_from_slice(&data);
        if !self.output.ready_to_send.swap(true, Ordering::SeqCst) {
            self.output.write_interest.notify_one();
            match self.output.flushed.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    return Err(CommError::new(
                        ErrorKind::Sending,
                        "channel closed while sending",
                    ))
                }
            }
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        let opened = match self.context.mode {
            ConnectionMode::Client => self.open_client().await,
            ConnectionMode::Server => self.open_server().await,
        };
        self.connecting.store(false, Ordering::SeqCst);

        match opened {
            Ok((input, output)) => {
                if !self.is_active() {
                    return;
                }
                info!("Connection {} established", self.context);
                self.observer.connected().await;

                let cause = self.event_loop(input, output).await;
                self.close(cause).await;
            }
            Err(err) => {
                if !self.active.swap(false, Ordering::SeqCst) {
                    debug!("Connection attempt of {} ended after close: {}", self.context, err);
                    return;
                }
                self.output.flushed.close();
                lock(&self.worker).take();

                error!("Connection attempt of {} failed: {}", self.context, err);
                self.observer.error(err).await;
                self.observer.disconnected().await;
            }
        }
    }

    /// Report the end of the event loop, unless someone else already did
    async fn close(&self, cause: CommError) {
        if !self.active.swap(false, Ordering::SeqCst) {
            debug!("Ignoring failure after close of {}: {}", self.context, cause);
            return;
        }
        self.output.flushed.close();
        lock(&self.worker).take();

        warn!("Connection {} lost: {}", self.context, cause);
        self.observer.disconnected_with_error(cause).await;
    }

    async fn open_client(&self) -> Result<(TcpStream, TcpStream), CommError> {
        let deadline = Instant::now() + self.context.timeout;
        let output = self.open_channel("output", deadline).await?;
        let input = self.open_channel("input", deadline).await?;
        Ok((input, output))
    }

    async fn open_channel(&self, channel: &str, deadline: Instant) -> Result<TcpStream, CommError> {
        let host = self.context.host.as_str();
        let port = self.context.port;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CommError::new(
                    ErrorKind::ConnectionError,
                    format!("could not open the {} channel", channel),
                )
                .with_arg("channel", channel)
                .with_arg("address", format!("{}:{}", host, port))
                .with_cause(
                    CommError::new(ErrorKind::Timeout, "connection timeout elapsed")
                        .with_arg("timeout_millis", self.context.timeout.as_millis()),
                ));
            }

            match timeout(remaining, TcpStream::connect((host, port))).await {
                Ok(Ok(stream)) => {
                    debug!("{} channel of {} connected", channel, self.context);
                    configure(&stream);
                    return Ok(stream);
                }
                Ok(Err(e)) => trace!("Opening {} channel of {} failed: {}", channel, self.context, e),
                Err(_) => continue,
            }

            let pause = deadline.saturating_duration_since(Instant::now());
            sleep(CONNECT_RETRY_DELAY.min(pause)).await;
        }
    }

    async fn open_server(&self) -> Result<(TcpStream, TcpStream), CommError> {
        let port = self.context.port;
        let listener = TcpListener::bind((LISTEN_ADDRESS, port)).await.map_err(|e| {
            CommError::io(ErrorKind::ConnectionError, "cannot listen for the peer", &e)
                .with_arg("port", port)
        })?;
        info!("Listening for {} on port {}", self.context, port);

        let input = self.accept(&listener, "input").await?;
        let output = self.accept(&listener, "output").await?;
        Ok((input, output))
    }

    async fn accept(&self, listener: &TcpListener, channel: &str) -> Result<TcpStream, CommError> {
        let (stream, peer_addr) = listener.accept().await.map_err(|e| {
            CommError::io(ErrorKind::ConnectionError, "accept failed", &e).with_arg("channel", channel)
        })?;
        debug!("{} channel of {} accepted from {}", channel, self.context, peer_addr);
        configure(&stream);
        Ok(stream)
    }

    async fn event_loop(&self, input: TcpStream, mut output: TcpStream) -> CommError {
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            tokio::select! {
                ready = input.readable() => {
                    if let Err(e) = ready {
                        return CommError::io(ErrorKind::CommunicationError, "input channel failed", &e);
                    }
                    let (data, closed) = self.drain_input(&input, &mut read_buf);
                    if let Some(data) = data {
                        trace!("Received {} bytes on {}", data.len(), self.context);
                        self.observer.receive(data).await;
                    }
                    if let Some(cause) = closed {
                        return cause;
                    }
                }
                _ = self.output.write_interest.notified() => {
                    if let Err(cause) = self.flush(&mut output).await {
                        return cause;
                    }
                }
            }
        }
    }

    /// Read everything available without blocking
    fn drain_input(&self, input: &TcpStream, read_buf: &mut BytesMut) -> (Option<Bytes>, Option<CommError>) {
        let mut closed = None;
        loop {
            read_buf.reserve(READ_BUFFER_SIZE);
            match input.try_read_buf(read_buf) {
                Ok(0) => {
                    closed = Some(CommError::new(
                        ErrorKind::RemoteDisconnection,
                        "peer closed the input channel",
                    ));
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    closed = Some(CommError::io(ErrorKind::CommunicationError, "read failed", &e));
                    break;
                }
            }
        }

        let data = (!read_buf.is_empty()).then(|| read_buf.split().freeze());
        (data, closed)
    }

    async fn flush(&self, output: &mut TcpStream) -> Result<(), CommError> {
        if !self.output.ready_to_send.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let data = lock(&self.output.pending).split().freeze();
        output
            .write_all(&data)
            .await
            .map_err(|e| CommError::io(ErrorKind::SocketError, "write failed", &e))?;
        trace!("Flushed {} bytes on {}", data.len(), self.context);

        self.output.flushed.add_permits(1);
        Ok(())
    }
}

fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Cannot disable Nagle on {:?}: {}", stream.peer_addr().ok(), e);
    }
}
