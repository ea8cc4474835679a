//! Error kinds and the structured error delivered to listeners.

use link_wire::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of link errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Error without a more precise classification
    UndefinedError,
    /// Value that cannot be converted to the expected type
    TypeConvert,
    /// Missing or inconsistent configuration
    Configuration,
    /// Peer TSAPs differ from the configured ones
    Tsaps,
    /// Payload could not be encoded
    Encode,
    /// Received bytes could not be decoded
    Decode,
    /// Received payload does not follow the message grammar
    ParseMessage,
    /// Outgoing message could not be built
    BuildMessage,
    /// A message was never acknowledged
    AkFailure,
    /// Connection could not be established
    ConnectionError,
    /// Disconnection requested in a state that does not allow it
    DisconnectionError,
    /// Failure on an established link
    CommunicationError,
    /// Socket-level I/O failure
    SocketError,
    /// Message could not be sent
    Sending,
    /// TPKT larger than the maximum size
    TpktTooLong,
    /// The peer closed the link
    RemoteDisconnection,
    /// An operation ran out of time
    Timeout,
}

impl ErrorKind {
    /// Kinds that forbid an automatic reconnection
    pub const FATAL: [ErrorKind; 3] = [ErrorKind::Tsaps, ErrorKind::AkFailure, ErrorKind::TpktTooLong];

    /// Whether this kind blocks reconnection
    pub fn is_fatal(self) -> bool {
        Self::FATAL.contains(&self)
    }

    /// Stable upper-case name
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UndefinedError => "UNDEFINED_ERROR",
            ErrorKind::TypeConvert => "TYPE_CONVERT",
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::Tsaps => "TSAPS",
            ErrorKind::Encode => "ENCODE",
            ErrorKind::Decode => "DECODE",
            ErrorKind::ParseMessage => "PARSE_MESSAGE",
            ErrorKind::BuildMessage => "BUILD_MESSAGE",
            ErrorKind::AkFailure => "AK_FAILURE",
            ErrorKind::ConnectionError => "CONNECTION_ERROR",
            ErrorKind::DisconnectionError => "DISCONNECTION_ERROR",
            ErrorKind::CommunicationError => "COMMUNICATION_ERROR",
            ErrorKind::SocketError => "SOCKET_ERROR",
            ErrorKind::Sending => "SENDING",
            ErrorKind::TpktTooLong => "TPKT_TOO_LONG",
            ErrorKind::RemoteDisconnection => "REMOTE_DISCONNECTION",
            ErrorKind::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link error: a kind, a message, ordered context arguments and an optional cause
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{kind}] {message}")]
pub struct CommError {
    kind: ErrorKind,
    message: String,
    args: Vec<(String, String)>,
    #[source]
    cause: Option<Box<CommError>>,
}

impl CommError {
    /// Create an error without arguments or cause
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            args: Vec::new(),
            cause: None,
        }
    }

    /// Add a context argument, replacing any previous value for `key`
    pub fn with_arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        let value = value.to_string();
        match self.args.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.args.push((key, value)),
        }
        self
    }

    /// Attach the error that caused this one
    pub fn with_cause(mut self, cause: CommError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build an error from an I/O failure
    pub fn io(kind: ErrorKind, message: impl Into<String>, err: &std::io::Error) -> Self {
        Self::new(kind, message)
            .with_arg("io_kind", format!("{:?}", err.kind()))
            .with_arg("io_error", err)
    }

    /// Error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Context arguments in insertion order
    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    /// Value of a context argument
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Direct cause
    pub fn cause(&self) -> Option<&CommError> {
        self.cause.as_deref()
    }

    /// This error followed by its causes
    pub fn chain(&self) -> impl Iterator<Item = &CommError> {
        std::iter::successors(Some(self), |err| err.cause())
    }

    /// Whether `kind` appears anywhere in the cause chain
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.chain().any(|err| err.kind == kind)
    }

    /// Whether any error in the cause chain blocks reconnection
    pub fn is_fatal(&self) -> bool {
        self.chain().any(|err| err.kind.is_fatal())
    }
}

impl From<WireError> for CommError {
    fn from(err: WireError) -> Self {
        match &err {
            WireError::TooLong { size, max } => {
                CommError::new(ErrorKind::TpktTooLong, err.to_string())
                    .with_arg("tpkt_size", size)
                    .with_arg("max_size", max)
            }
            WireError::Tsap(_) => CommError::new(ErrorKind::Tsaps, err.to_string()),
            WireError::Field { field, value } => {
                CommError::new(ErrorKind::ParseMessage, err.to_string())
                    .with_arg("field", field)
                    .with_arg("value", value)
            }
            WireError::Version(_)
            | WireError::Overflow(_)
            | WireError::Type(_)
            | WireError::Malformed(_) => CommError::new(ErrorKind::Decode, err.to_string()),
        }
    }
}
