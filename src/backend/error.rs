use std::error::Error as StdError;
use std::fmt;

/// Transport-level failures reported by a backend adapter.
///
/// Never handed to listeners as-is: the manager reduces them to their
/// `Display` string before emitting lifecycle events.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// HTTP request (probe, negotiate) failed
    Http(reqwest::Error),
    /// Liveness probe answered with a server error
    Probe {
        /// HTTP status returned by the endpoint
        status: u16,
    },
    /// Endpoint URL could not be turned into a transport URL
    InvalidUrl(String),
    /// The protocol handshake was rejected or malformed
    Handshake(String),
    /// Received a frame that does not follow the wire protocol
    Protocol(String),
    /// The remote side answered an invocation with an error
    Invocation(String),
    /// Error encoding or decoding a JSON payload
    Json(serde_json::Error),
    /// The handle is no longer able to carry messages
    NotReady,
    /// WebSocket connection was closed
    ConnectionClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Http(e) => write!(f, "HTTP request failed: {e}"),
            Self::Probe { status } => write!(f, "liveness probe failed with status {status}"),
            Self::InvalidUrl(url) => write!(f, "invalid endpoint url: {url}"),
            Self::Handshake(reason) => write!(f, "handshake failed: {reason}"),
            Self::Protocol(reason) => write!(f, "protocol error: {reason}"),
            Self::Invocation(reason) => write!(f, "invocation failed: {reason}"),
            Self::Json(e) => write!(f, "invalid JSON payload: {e}"),
            Self::NotReady => write!(f, "transport is not ready"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Http(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}
