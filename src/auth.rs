//! Authentication tokens presented on every connection attempt.

use std::fmt;
use std::sync::Arc;

/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};

type Resolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Token handed to the backend when a transport is opened.
///
/// A [`AuthToken::Resolver`] is invoked again for every attempt, so a rotated
/// credential takes effect on the next reconnect without rebuilding the manager.
#[non_exhaustive]
#[derive(Clone)]
pub enum AuthToken {
    /// Fixed token
    Static(SecretString),
    /// Zero-argument function returning the current token, if any
    Resolver(Resolver),
}

impl AuthToken {
    #[must_use]
    pub fn from_static<S: Into<String>>(token: S) -> Self {
        Self::Static(SecretString::from(token.into()))
    }

    pub fn from_resolver<F>(resolver: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self::Resolver(Arc::new(resolver))
    }

    /// Resolve the token for a single connection attempt. Never cached.
    #[must_use]
    pub fn resolve(&self) -> Option<SecretString> {
        match self {
            Self::Static(token) => Some(token.clone()),
            Self::Resolver(resolver) => resolver()
                .filter(|token| !token.is_empty())
                .map(SecretString::from),
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => f.write_str("AuthToken::Static([REDACTED])"),
            Self::Resolver(_) => f.write_str("AuthToken::Resolver(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn resolver_is_invoked_on_every_resolve() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let token = AuthToken::from_resolver(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Some(format!("token-{n}"))
        });

        let first = token.resolve().expect("first token");
        let second = token.resolve().expect("second token");

        assert_eq!(first.expose_secret(), "token-0");
        assert_eq!(second.expose_secret(), "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_resolved_token_is_treated_as_absent() {
        let token = AuthToken::from_resolver(|| Some(String::new()));
        assert!(token.resolve().is_none(), "empty token should be dropped");

        let token = AuthToken::from_resolver(|| None);
        assert!(token.resolve().is_none(), "null token should be dropped");
    }

    #[test]
    fn debug_output_is_redacted() {
        let token = AuthToken::from_static("hunter2");
        let debug = format!("{token:?}");

        assert!(!debug.contains("hunter2"), "secret leaked: {debug}");
        assert_eq!(token.resolve().expect("static").expose_secret(), "hunter2");
    }
}
