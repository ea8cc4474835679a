//! Reliable point-to-point messaging over RFC1006 (TPKT) for redb.
//!
//! Facade over the link crates:
//!
//! - [`wire`]: TPKT/TSDU framing, reassembly, sequence numbers and the message envelope
//! - [`session`]: sockets, handshake, acknowledgements and the [`Connection`] handler
//! - [`logging`]: console log format and subscriber setup
//!
//! ```rust,no_run
//! use redb_link::{Connection, ConnectionContext};
//! # use redb_link::ConnectionListener;
//! # use std::sync::Arc;
//! # async fn example(listener: Arc<dyn ConnectionListener>) -> anyhow::Result<()> {
//! redb_link::logging::init_logging("link", "debug")?;
//!
//! let context = ConnectionContext::load_from_file("link.yaml")?;
//! let connection = Connection::new(context, listener);
//! connection.connect().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod logging;

pub use link_session as session;
pub use link_wire as wire;

pub use link_session::{
    CommError, Connection, ConnectionConfig, ConnectionContext, ConnectionEvent, ConnectionListener,
    ConnectionMode, ConnectionState, ErrorKind,
};
pub use link_wire::{Message, MessageCodec, MessageType, SequenceNumber, TextCodec};
