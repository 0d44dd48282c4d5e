//! JSON hub protocol: record-separated JSON messages over a text WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::TransportError;

/// Terminates every message on the wire.
pub(crate) const RECORD_SEPARATOR: char = '\u{1e}';

pub(crate) const INVOCATION: u8 = 1;
pub(crate) const COMPLETION: u8 = 3;
pub(crate) const PING: u8 = 6;
pub(crate) const CLOSE: u8 = 7;

/// Client handshake announcing the JSON protocol.
pub(crate) fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

/// Keep-alive frame.
pub(crate) fn ping_frame() -> String {
    format!(r#"{{"type":{PING}}}{RECORD_SEPARATOR}"#)
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    error: Option<String>,
}

/// Validate the handshake response and return any messages that followed it in the same frame.
pub(crate) fn parse_handshake(text: &str) -> Result<Vec<String>, TransportError> {
    let (response, rest) = text
        .split_once(RECORD_SEPARATOR)
        .ok_or_else(|| TransportError::Handshake("unterminated handshake response".to_owned()))?;

    let response: HandshakeResponse = serde_json::from_str(response)?;
    if let Some(error) = response.error {
        return Err(TransportError::Handshake(error));
    }

    Ok(split_frames(rest).map(str::to_owned).collect())
}

/// Individual messages of one text frame.
pub(crate) fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|frame| !frame.is_empty())
}

/// Any hub message. Fields not relevant to a message type are absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HubMessage {
    #[serde(rename = "type")]
    pub(crate) kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl HubMessage {
    pub(crate) fn decode(frame: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Invocation that expects a completion carrying `invocation_id`.
    pub(crate) fn invocation(invocation_id: String, target: &str, payload: Value) -> Self {
        let arguments = if payload.is_null() {
            Vec::new()
        } else {
            vec![payload]
        };
        Self {
            kind: INVOCATION,
            invocation_id: Some(invocation_id),
            target: Some(target.to_owned()),
            arguments: Some(arguments),
            ..Self::default()
        }
    }

    pub(crate) fn encode(&self) -> Result<String, TransportError> {
        Ok(format!("{}{RECORD_SEPARATOR}", serde_json::to_string(self)?))
    }
}

/// Body of `POST {endpoint}/negotiate?negotiateVersion=1`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NegotiateResponse {
    pub(crate) connection_id: Option<String>,
    pub(crate) connection_token: Option<String>,
    #[serde(default)]
    pub(crate) available_transports: Vec<AvailableTransport>,
    /// Redirect to another endpoint.
    pub(crate) url: Option<String>,
    /// Token to use against the redirect target.
    pub(crate) access_token: Option<String>,
    pub(crate) error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AvailableTransport {
    pub(crate) transport: String,
    #[serde(default)]
    pub(crate) transfer_formats: Vec<String>,
}

impl NegotiateResponse {
    pub(crate) fn supports_websockets(&self) -> bool {
        self.available_transports.iter().any(|t| {
            t.transport == "WebSockets" && t.transfer_formats.iter().any(|f| f == "Text")
        })
    }

    /// Identifier the WebSocket URL must carry as `id`.
    pub(crate) fn connection_id(&self) -> Option<&str> {
        self.connection_token
            .as_deref()
            .or(self.connection_id.as_deref())
    }
}
