//! Connection lifecycle, reliable delivery, RFC1006 handshake and dual-channel sockets for link.
//!
//! This crate provides a long-lived, auto-reconnecting, acknowledged message
//! channel between two peers, usable as the client or the server side.
//!
//! ## Features
//!
//! - **Connection state machine**: gated connect/disconnect/send with ordered listener events
//! - **Reliable delivery**: sequence numbers, acknowledgements, retransmission and failure detection
//! - **RFC1006 transport**: TPKT framing, reassembly and CR/CC handshake with TSAP checks
//! - **Socket engine**: two unidirectional TCP channels per link, readiness-driven I/O
//! - **Auto-reconnect**: a lost link is reopened after one second unless the cause is fatal
//!
//! ## Example
//!
//! ```rust,no_run
//! use link_session::{CommError, Connection, ConnectionContext, ConnectionListener, ConnectionMode};
//! use link_wire::{Message, MessageType};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Printer;
//!
//! impl ConnectionListener for Printer {
//!     fn connected(&self, context: &ConnectionContext) {
//!         println!("{} connected", context);
//!     }
//!     fn disconnected(&self, context: &ConnectionContext) {
//!         println!("{} disconnected", context);
//!     }
//!     fn error(&self, context: &ConnectionContext, error: &CommError) {
//!         println!("{}: {}", context, error);
//!     }
//!     fn received(&self, context: &ConnectionContext, message: Message) {
//!         println!("{} received {}", context, message);
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let context = ConnectionContext::new(ConnectionMode::Client, "CALLING", "CALLED")
//!     .with_host("10.0.0.2")
//!     .with_port(102);
//! let connection = Connection::new(context, Arc::new(Printer));
//!
//! connection.connect().await;
//! connection.send(Message::new(MessageType::new("PR")?, "42")).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod layer;
pub mod message;
pub mod notifier;
pub mod rfc1006;
pub mod socket;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use config::{ConnectionConfig, ConnectionContext, ConnectionMode};
pub use connection::{Connection, RECONNECT_DELAY};
pub use error::{CommError, ErrorKind};
pub use layer::{ConnectionState, LayerCommands, LayerObserver};
pub use message::{AckSettings, MessageLayer};
pub use notifier::{ConnectionEvent, ConnectionListener, EventNotifier};
pub use rfc1006::Rfc1006Layer;
pub use socket::SocketLayer;
