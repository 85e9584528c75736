//! # SignalR JSON Hub Protocol
//!
//! Text framing used by the order hub. Every message is a JSON object
//! terminated by the `0x1E` record separator; one WebSocket text frame may
//! carry several of them. The client opens with a handshake naming the
//! protocol and waits for an empty `{}` reply.
//!
//! Message types the watcher cares about:
//! - `1` invocation (`target`, `arguments`)
//! - `6` ping
//! - `7` close (optional `error`)
//!
//! Stream, completion, ack and sequence messages are ignored.

use serde_json::{json, Value};
use url::Url;

use crate::core::HubFrame;
use crate::error::{WatchError, WatchResult};

/// Terminates every hub message.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub endpoint under the API base URL.
pub const HUB_PATH: &str = "OrdersHub";

const INVOCATION: u64 = 1;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// Handshake opening every session.
pub fn handshake_request() -> String {
    format!("{}{}", json!({ "protocol": "json", "version": 1 }), RECORD_SEPARATOR)
}

/// Client keep-alive message.
pub fn ping_message() -> String {
    format!("{}{}", json!({ "type": PING }), RECORD_SEPARATOR)
}

/// Checks the handshake reply. Returns whatever followed it in the same
/// frame, which may already hold hub messages.
pub fn parse_handshake_response(text: &str) -> WatchResult<&str> {
    let Some((head, rest)) = text.split_once(RECORD_SEPARATOR) else {
        return Err(WatchError::Connection("incomplete handshake response".into()));
    };
    let reply: Value = serde_json::from_str(head)
        .map_err(|e| WatchError::Connection(format!("invalid handshake response: {}", e)))?;
    if let Some(error) = reply.get("error").and_then(Value::as_str) {
        return Err(WatchError::Connection(format!("hub rejected handshake: {}", error)));
    }
    Ok(rest)
}

/// Splits a text frame into hub messages. Unknown message types are dropped,
/// malformed ones come back as `WatchError::Protocol`.
pub fn decode_messages(text: &str) -> Vec<WatchResult<HubFrame>> {
    text.split(RECORD_SEPARATOR)
        .filter(|raw| !raw.trim().is_empty())
        .filter_map(decode_message)
        .collect()
}

fn decode_message(raw: &str) -> Option<WatchResult<HubFrame>> {
    let message: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => return Some(Err(WatchError::Protocol(format!("{}: {}", e, raw)))),
    };

    match message.get("type").and_then(Value::as_u64) {
        Some(INVOCATION) => {
            let Some(target) = message.get("target").and_then(Value::as_str) else {
                return Some(Err(WatchError::Protocol(format!("invocation without target: {}", raw))));
            };
            let arguments = message
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Some(Ok(HubFrame::Invocation {
                target: target.to_string(),
                arguments,
            }))
        }
        Some(PING) => Some(Ok(HubFrame::Ping)),
        Some(CLOSE) => Some(Ok(HubFrame::Close {
            error: message.get("error").and_then(Value::as_str).map(str::to_string),
        })),
        Some(other) => {
            log::trace!("Ignoring hub message type {}", other);
            None
        }
        None => Some(Err(WatchError::Protocol(format!("message without type: {}", raw)))),
    }
}

/// Hub WebSocket URL for an API base URL: `http` becomes `ws`, `https`
/// becomes `wss`, and `hub_path` is appended to the base path.
pub fn hub_url(base: &str, hub_path: &str) -> WatchResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| WatchError::Config(format!("invalid API base URL '{}': {}", base, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(WatchError::Config(format!("unsupported URL scheme '{}'", other)));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| WatchError::Config(format!("cannot switch '{}' to {}", base, scheme)))?;
    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        hub_path.trim_start_matches('/')
    );
    url.set_path(&path);
    url.set_query(None);
    Ok(url)
}

/// Appends the bearer token the way browser clients pass it to hubs.
pub fn with_access_token(url: &mut Url, token: &str) {
    url.query_pairs_mut().append_pair("access_token", token);
}
