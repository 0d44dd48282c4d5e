use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Result;
use crate::auth::AuthToken;
use crate::error::Error;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EVENT_SOCKET_PATH: &str = "/socket.io/";

/// Transport family backing a manager. Fixed for the lifetime of the manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[non_exhaustive]
pub enum BackendKind {
    /// Bidirectional event socket (Socket.IO wire format)
    #[serde(rename = "eventSocket", alias = "socketio")]
    #[strum(serialize = "eventSocket")]
    EventSocket,
    /// Persistent hub RPC connection (SignalR JSON hub protocol)
    #[serde(rename = "hubRpc", alias = "signalr")]
    #[strum(serialize = "hubRpc")]
    HubRpc,
}

/// Configuration for a [`crate::SocketManager`]. Immutable once the manager is built.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cap_socket::config::{BackendKind, ManagerConfig, ReconnectConfig};
///
/// let config = ManagerConfig::builder()
///     .backend(BackendKind::EventSocket)
///     .url("http://localhost:3001")
///     .reconnect(
///         ReconnectConfig::builder()
///             .max_attempts(3)
///             .base_delay(Duration::from_secs(1))
///             .max_delay(Duration::from_secs(5))
///             .build(),
///     )
///     .build();
///
/// assert_eq!(config.reconnect.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Builder)]
#[non_exhaustive]
pub struct ManagerConfig {
    /// Which backend adapter to use.
    pub backend: BackendKind,
    /// Endpoint URL (`http`, `https`, `ws` or `wss`).
    #[builder(into)]
    pub url: String,
    /// Enables debug logging of non-fatal transitions.
    #[builder(default)]
    pub debug: bool,
    /// Reconnection policy.
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Upper bound for a single open attempt. Expiry counts as a transient failure.
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    /// Token resolved freshly on every connection attempt.
    pub auth: Option<AuthToken>,
    /// When set, `connect` waits until the episode settles instead of returning after dispatch.
    #[builder(default)]
    pub wait_for_connection: bool,
    /// Options used only by the event socket backend.
    #[builder(default)]
    pub event_socket: EventSocketOptions,
    /// Options used only by the hub RPC backend.
    #[builder(default)]
    pub hub_rpc: HubRpcOptions,
}

impl ManagerConfig {
    /// Check the endpoint URL and timers before a manager is built around them.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::validation("url must not be empty"));
        }

        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported url scheme `{}`, expected http(s) or ws(s)",
                url.scheme()
            )));
        }

        let timers = [
            ("connect_timeout", self.connect_timeout),
            ("event_socket.probe_timeout", self.event_socket.probe_timeout),
            ("hub_rpc.keep_alive_interval", self.hub_rpc.keep_alive_interval),
            ("hub_rpc.server_timeout", self.hub_rpc.server_timeout),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| value.is_zero()) {
            return Err(Error::validation(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}

/// Linear-capped reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
#[non_exhaustive]
pub struct ReconnectConfig {
    /// Consecutive failures tolerated per episode. `0` retries forever.
    #[builder(default)]
    pub max_attempts: u32,
    /// Delay unit; the n-th wait is `base_delay * n`.
    #[builder(default = DEFAULT_BASE_DELAY)]
    pub base_delay: Duration,
    /// Cap applied to every wait.
    #[builder(default = DEFAULT_MAX_DELAY)]
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectConfig {
    /// Whether the policy ever gives up.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }
}

/// Event socket backend options.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[non_exhaustive]
pub struct EventSocketOptions {
    /// Server mount path of the socket endpoint.
    #[builder(into, default = DEFAULT_EVENT_SOCKET_PATH.to_owned())]
    pub path: String,
    /// Probe the endpoint's base path over HTTP before each handshake.
    #[builder(default = true)]
    pub probe: bool,
    /// Timeout for the liveness probe request.
    #[builder(default = DEFAULT_PROBE_TIMEOUT)]
    pub probe_timeout: Duration,
}

impl Default for EventSocketOptions {
    fn default() -> Self {
        Self {
            path: DEFAULT_EVENT_SOCKET_PATH.to_owned(),
            probe: true,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Hub RPC backend options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
#[non_exhaustive]
pub struct HubRpcOptions {
    /// Connect the WebSocket transport directly, without the negotiate round trip.
    #[builder(default)]
    pub skip_negotiation: bool,
    /// Interval between client keep-alive pings.
    #[builder(default = DEFAULT_KEEP_ALIVE_INTERVAL)]
    pub keep_alive_interval: Duration,
    /// Silence from the server longer than this is a transient failure.
    #[builder(default = DEFAULT_SERVER_TIMEOUT)]
    pub server_timeout: Duration,
}

impl Default for HubRpcOptions {
    fn default() -> Self {
        Self {
            skip_negotiation: false,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_should_retry_forever_with_linear_cap() {
        let config = ManagerConfig::builder()
            .backend(BackendKind::HubRpc)
            .url("https://example.com/hub")
            .build();

        assert!(config.reconnect.is_unlimited(), "default is unlimited");
        assert_eq!(config.reconnect.base_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.event_socket.path, "/socket.io/");
        assert!(!config.hub_rpc.skip_negotiation, "negotiate by default");
        assert!(config.auth.is_none(), "no auth by default");
    }

    #[test]
    fn validate_should_reject_bad_urls() {
        let empty = ManagerConfig::builder()
            .backend(BackendKind::EventSocket)
            .url("  ")
            .build();
        assert!(empty.validate().is_err(), "empty url accepted");

        let ftp = ManagerConfig::builder()
            .backend(BackendKind::EventSocket)
            .url("ftp://example.com")
            .build();
        assert!(ftp.validate().is_err(), "ftp url accepted");

        let ws = ManagerConfig::builder()
            .backend(BackendKind::EventSocket)
            .url("ws://x")
            .build();
        assert!(ws.validate().is_ok(), "ws url rejected");
    }

    #[test]
    fn validate_should_reject_zero_durations() {
        let base = ManagerConfig::builder()
            .backend(BackendKind::HubRpc)
            .url("https://example.com/hub")
            .build();
        assert!(base.validate().is_ok(), "defaults rejected");

        let mut keep_alive = base.clone();
        keep_alive.hub_rpc.keep_alive_interval = Duration::ZERO;
        let mut server_timeout = base.clone();
        server_timeout.hub_rpc.server_timeout = Duration::ZERO;
        let mut probe_timeout = base.clone();
        probe_timeout.event_socket.probe_timeout = Duration::ZERO;
        let mut connect_timeout = base;
        connect_timeout.connect_timeout = Duration::ZERO;

        for (config, field) in [
            (keep_alive, "keep_alive_interval"),
            (server_timeout, "server_timeout"),
            (probe_timeout, "probe_timeout"),
            (connect_timeout, "connect_timeout"),
        ] {
            let err = config.validate().unwrap_err();
            assert_eq!(err.kind(), crate::error::Kind::Validation);
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn backend_kind_accepts_legacy_names() -> anyhow::Result<()> {
        let kind: BackendKind = serde_json::from_str("\"socketio\"")?;
        assert_eq!(kind, BackendKind::EventSocket);

        let kind: BackendKind = serde_json::from_str("\"signalr\"")?;
        assert_eq!(kind, BackendKind::HubRpc);

        assert_eq!(BackendKind::HubRpc.to_string(), "hubRpc");
        Ok(())
    }
}
