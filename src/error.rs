use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::types::FunctionPath;

/// Remote messages that signal a connectivity problem rather than a refusal.
const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "etimedout",
    "econnrefused",
    "socket hang up",
    "connection reset",
    "connection lost",
    "try again",
    "service unavailable",
];

/// A raw failure reported by one channel.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("channel closed")]
    Closed,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("{message}")]
    Remote { message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to succeed on another channel.
    Transient,
    /// The service refused the call; switching channel will not help.
    Fatal,
}

impl ChannelError {
    pub fn remote(message: impl Into<String>) -> Self {
        ChannelError::Remote {
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        let transient = match self {
            ChannelError::Http(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.is_request()
                    || e.status().is_some_and(|s| is_unavailable_status(s.as_u16()))
            }
            ChannelError::WebSocket(e) => {
                use tokio_tungstenite::tungstenite::Error as WsError;
                matches!(
                    e,
                    WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Io(_)
                        | WsError::Protocol(_)
                )
            }
            ChannelError::Io(e) => is_transient_io(e.kind()),
            ChannelError::Closed | ChannelError::Unavailable(_) => true,
            ChannelError::Remote { message } => has_transient_marker(message),
            ChannelError::Rejected(_)
            | ChannelError::Protocol(_)
            | ChannelError::Serialization(_) => false,
        };

        if transient {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub(crate) fn is_unavailable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 502 | 503 | 504)
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    use io::ErrorKind::*;
    matches!(
        kind,
        ConnectionReset
            | ConnectionAborted
            | ConnectionRefused
            | BrokenPipe
            | TimedOut
            | UnexpectedEof
            | NotConnected
            | Interrupted
    )
}

fn has_transient_marker(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m))
}

/// What callers of the transport and the multiplexer observe.
///
/// Cloneable so that every caller coalesced onto one subscription attempt
/// receives the same failure.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(Arc<ChannelError>),
    #[error("{0}")]
    Fatal(Arc<ChannelError>),
    #[error("{path} timed out after {after:?}")]
    Timeout { path: FunctionPath, after: Duration },
    #[error("lookup error: {0}")]
    Lookup(String),
}

impl TransportError {
    pub fn lookup(message: impl Into<String>) -> Self {
        TransportError::Lookup(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    pub fn channel_error(&self) -> Option<&ChannelError> {
        match self {
            TransportError::Transient(e) | TransportError::Fatal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for TransportError {
    fn from(error: ChannelError) -> Self {
        match error.class() {
            ErrorClass::Transient => TransportError::Transient(Arc::new(error)),
            ErrorClass::Fatal => TransportError::Fatal(Arc::new(error)),
        }
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
