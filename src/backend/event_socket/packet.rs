//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! An Engine.IO packet is a one-digit type followed by its data. Socket
//! packets travel inside Engine.IO `message` packets, so an event on the
//! default namespace looks like `42["name",arg1,arg2]`.

use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::backend::{TransportError, payload_from_args};

/// Engine.IO `pong` answering a ping.
pub(crate) const PONG: &str = "3";
/// Socket.IO default namespace.
pub(crate) const ROOT_NAMESPACE: &str = "/";

/// Session parameters sent by the server in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OpenPayload {
    /// Milliseconds between server pings
    pub(crate) ping_interval: u64,
    /// Milliseconds the server waits for a pong
    pub(crate) ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EnginePacket<'a> {
    Open(OpenPayload),
    Close,
    Ping,
    Pong,
    Message(&'a str),
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SocketPacket {
    Connect,
    Disconnect,
    Event { event: String, payload: Value },
    ConnectError { message: String },
    /// Acks and binary packets are not used by this client.
    Unsupported(char),
}

pub(crate) fn decode_engine(text: &str) -> Result<EnginePacket<'_>, TransportError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| TransportError::Protocol("empty frame".to_owned()))?;
    let data = chars.as_str();

    match kind {
        '0' => Ok(EnginePacket::Open(serde_json::from_str(data)?)),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping),
        '3' => Ok(EnginePacket::Pong),
        '4' => Ok(EnginePacket::Message(data)),
        '5' | '6' => Ok(EnginePacket::Noop),
        other => Err(TransportError::Protocol(format!(
            "unknown engine packet type `{other}`"
        ))),
    }
}

/// Decode a socket packet into the namespace it addresses and its content.
pub(crate) fn decode_socket(data: &str) -> Result<(&str, SocketPacket), TransportError> {
    let mut chars = data.chars();
    let kind = chars
        .next()
        .ok_or_else(|| TransportError::Protocol("empty socket packet".to_owned()))?;
    let (namespace, body) = split_namespace(chars.as_str());
    let body = strip_ack_id(body);

    let packet = match kind {
        '0' => SocketPacket::Connect,
        '1' => SocketPacket::Disconnect,
        '2' => {
            let mut items: Vec<Value> = serde_json::from_str(body)?;
            if items.is_empty() {
                return Err(TransportError::Protocol("event without a name".to_owned()));
            }
            let Value::String(event) = items.remove(0) else {
                return Err(TransportError::Protocol("event name is not a string".to_owned()));
            };
            SocketPacket::Event {
                event,
                payload: payload_from_args(items),
            }
        }
        '4' => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| match v {
                    Value::Object(mut map) => map.remove("message"),
                    other => Some(other),
                })
                .map_or_else(
                    || body.to_owned(),
                    |v| v.as_str().map_or_else(|| v.to_string(), str::to_owned),
                );
            SocketPacket::ConnectError { message }
        }
        other => SocketPacket::Unsupported(other),
    };
    Ok((namespace, packet))
}

/// Namespace named by the path of an endpoint URL, `/` when the path is empty.
pub(crate) fn namespace_from_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        ROOT_NAMESPACE.to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// `40`, `40{"token":"..."}`, or `40/chat,{"token":"..."}` outside the default namespace.
pub(crate) fn encode_connect(namespace: &str, token: Option<&SecretString>) -> String {
    let auth = token.map(|token| json!({ "token": token.expose_secret() }).to_string());
    format!("40{}{}", namespace_prefix(namespace), auth.unwrap_or_default())
}

/// `41` or `41/chat,`.
pub(crate) fn encode_disconnect(namespace: &str) -> String {
    format!("41{}", namespace_prefix(namespace))
}

/// `42["event",payload]`, or `42["event"]` for a null payload.
pub(crate) fn encode_event(
    namespace: &str,
    event: &str,
    payload: Value,
) -> Result<String, TransportError> {
    let frame = if payload.is_null() {
        serde_json::to_string(&[event])?
    } else {
        serde_json::to_string(&json!([event, payload]))?
    };
    Ok(format!("42{}{frame}", namespace_prefix(namespace)))
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace == ROOT_NAMESPACE {
        String::new()
    } else {
        format!("{namespace},")
    }
}

// `/admin,["x"]` -> (`/admin`, `["x"]`); `/admin` -> (`/admin`, ``)
fn split_namespace(body: &str) -> (&str, &str) {
    if body.starts_with('/') {
        body.split_once(',').unwrap_or((body, ""))
    } else {
        (ROOT_NAMESPACE, body)
    }
}

// `12["x"]` -> `["x"]`
fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}
