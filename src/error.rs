use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::backend::TransportError;
use crate::manager::ConnectionState;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `send` was called while the manager was not connected
    NotConnected,
    /// Error related to invalid configuration or arguments
    Validation,
    /// Error reported by the active transport backend
    Transport,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn not_connected(state: ConnectionState) -> Self {
        NotConnected { state }.into()
    }

    pub fn connection_failed<S: Into<String>>(reason: S) -> Self {
        ConnectionFailed {
            reason: reason.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// Returned by `send` when no transport is live.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct NotConnected {
    /// State observed when the call was rejected
    pub state: ConnectionState,
}

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not connected (state: {})", self.state)
    }
}

impl StdError for NotConnected {}

/// A connection episode settled to disconnected without ever connecting.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionFailed {
    pub reason: String,
}

impl fmt::Display for ConnectionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection failed: {}", self.reason)
    }
}

impl StdError for ConnectionFailed {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Error::with_source(Kind::NotConnected, err)
    }
}

impl From<ConnectionFailed> for Error {
    fn from(err: ConnectionFailed) -> Self {
        Error::with_source(Kind::Transport, err)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::with_source(Kind::Transport, err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_display_should_include_state() {
        let error = Error::not_connected(ConnectionState::Reconnecting);

        assert_eq!(error.kind(), Kind::NotConnected);
        assert_eq!(
            error.to_string(),
            "NotConnected: not connected (state: Reconnecting)"
        );
        assert!(
            error.downcast_ref::<NotConnected>().is_some(),
            "source should downcast to NotConnected"
        );
    }

    #[test]
    fn transport_error_into_error_should_succeed() {
        let error: Error = TransportError::NotReady.into();

        assert_eq!(error.kind(), Kind::Transport);
        assert!(error.to_string().contains("not ready"));
    }

    #[test]
    fn validation_display_should_succeed() {
        let error = Error::validation("url must not be empty");

        assert_eq!(error.kind(), Kind::Validation);
        assert_eq!(error.to_string(), "Validation: invalid: url must not be empty");
    }
}
