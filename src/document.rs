//! Runtime configuration document served next to the application.
//!
//! ```json
//! {
//!   "socket": {
//!     "type": "eventSocket",
//!     "url": "http://localhost:3001",
//!     "reconnect": { "maxAttempts": 5, "baseDelaySeconds": 1, "maxDelaySeconds": 5 }
//!   }
//! }
//! ```
//!
//! A missing, unreachable or malformed document behaves like `"type": "none"`.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::Result;
use crate::auth::AuthToken;
use crate::config::{BackendKind, ManagerConfig};
use crate::error::Error;

/// Location of the document relative to the application origin.
pub const DOCUMENT_PATH: &str = "/cap_socket_config.json";

/// Backend selection of the served document. `None` disables the manager.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SocketType {
    #[serde(rename = "eventSocket", alias = "socketio")]
    EventSocket,
    #[serde(rename = "hubRpc", alias = "signalr")]
    HubRpc,
    #[default]
    #[serde(rename = "none")]
    None,
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RuntimeDocument {
    #[serde(default)]
    pub socket: Option<SocketSection>,
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketSection {
    #[serde(rename = "type", default)]
    pub kind: SocketType,
    pub url: Option<String>,
    #[serde(default)]
    pub debug: bool,
    pub reconnect: Option<ReconnectSection>,
    pub connect_timeout_seconds: Option<f64>,
    pub token: Option<String>,
    /// Event socket mount path
    pub path: Option<String>,
    /// Event socket liveness probe
    pub probe: Option<bool>,
    /// Hub RPC transport hint
    pub skip_negotiation: Option<bool>,
}

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectSection {
    pub max_attempts: Option<u32>,
    pub base_delay_seconds: Option<f64>,
    pub max_delay_seconds: Option<f64>,
}

impl RuntimeDocument {
    /// Parse a document, degrading to an empty one when the text is not valid.
    #[must_use]
    pub fn from_json(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(document) => document,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "ignoring malformed runtime configuration");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                Self::default()
            }
        }
    }

    /// Manager configuration described by the document, or `None` for `"type": "none"`.
    ///
    /// A document that selects a backend must carry a usable `url`.
    pub fn into_manager_config(self) -> Result<Option<ManagerConfig>> {
        let Some(socket) = self.socket else {
            return Ok(None);
        };

        let backend = match socket.kind {
            SocketType::EventSocket => BackendKind::EventSocket,
            SocketType::HubRpc => BackendKind::HubRpc,
            SocketType::None => return Ok(None),
        };

        let url = socket
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::validation("socket.url is required when a backend is selected"))?;

        let mut config = ManagerConfig::builder()
            .backend(backend)
            .url(url)
            .debug(socket.debug)
            .maybe_auth(socket.token.map(AuthToken::from_static))
            .build();

        if let Some(reconnect) = socket.reconnect {
            if let Some(max_attempts) = reconnect.max_attempts {
                config.reconnect.max_attempts = max_attempts;
            }
            if let Some(base) = reconnect.base_delay_seconds {
                config.reconnect.base_delay = seconds("reconnect.baseDelaySeconds", base)?;
            }
            if let Some(max) = reconnect.max_delay_seconds {
                config.reconnect.max_delay = seconds("reconnect.maxDelaySeconds", max)?;
            }
        }
        if let Some(timeout) = socket.connect_timeout_seconds {
            config.connect_timeout = seconds("connectTimeoutSeconds", timeout)?;
        }
        if let Some(path) = socket.path {
            config.event_socket.path = path;
        }
        if let Some(probe) = socket.probe {
            config.event_socket.probe = probe;
        }
        if let Some(skip) = socket.skip_negotiation {
            config.hub_rpc.skip_negotiation = skip;
        }

        config.validate()?;
        Ok(Some(config))
    }
}

/// Fetch the document served at [`DOCUMENT_PATH`] under `base_url`.
///
/// Never fails: every problem degrades to an empty document.
pub async fn fetch(client: &Client, base_url: &str) -> RuntimeDocument {
    let url = match Url::parse(base_url).and_then(|base| base.join(DOCUMENT_PATH)) {
        Ok(url) => url,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, base_url, "invalid base url for runtime configuration");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return RuntimeDocument::default();
        }
    };

    let response = match client.get(url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(status = %response.status(), "no runtime configuration served");
            #[cfg(not(feature = "tracing"))]
            let _ = &response;
            return RuntimeDocument::default();
        }
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "failed to fetch runtime configuration");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return RuntimeDocument::default();
        }
    };

    match response.text().await {
        Ok(text) => RuntimeDocument::from_json(&text),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "failed to read runtime configuration");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            RuntimeDocument::default()
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_e| Error::validation(format!("{field} must be a non-negative number of seconds")))
}
