//! Wire types for the pulse node connection.
//!
//! Shared by the node runtime and its tests so the frame shapes cannot drift.
//! The remote service owns the protocol; this crate only covers what the
//! client sends (keep-alive pings) and the one inbound shape it acts on
//! (points updates). Every other inbound message is tolerated and ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Protocol version sent in the endpoint query string.
pub const PROTOCOL_VERSION: &str = "v0.2";
pub const DEFAULT_ENDPOINT_URL: &str = "wss://secure.ws.teneo.pro";
pub const DEFAULT_ENDPOINT_PATH: &str = "/websocket";

const POINTS_TOTAL_FIELD: &str = "pointsTotal";
const POINTS_TODAY_FIELD: &str = "pointsToday";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Ping,
}

impl ClientMessage {
    pub fn to_text(&self) -> String {
        // A fieldless tagged enum always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"PING"}"#.to_string())
    }
}

/// Server-authoritative totals carried by an inbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsUpdate {
    pub points_total: i64,
    pub points_today: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Points(PointsUpdate),
    /// Any other JSON payload. Kept so callers can log it.
    Other(Value),
}

/// Decodes one inbound text frame.
///
/// Only malformed JSON is an error. A payload that lacks either points field,
/// or carries a non-numeric one, decodes as [`ServerMessage::Other`].
pub fn parse_server_message(text: &str) -> Result<ServerMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let total = value.get(POINTS_TOTAL_FIELD).and_then(number_as_i64);
    let today = value.get(POINTS_TODAY_FIELD).and_then(number_as_i64);

    match (total, today) {
        (Some(points_total), Some(points_today)) => Ok(ServerMessage::Points(PointsUpdate {
            points_total,
            points_today,
        })),
        _ => Ok(ServerMessage::Other(value)),
    }
}

fn number_as_i64(value: &Value) -> Option<i64> {
    if let Some(int) = value.as_i64() {
        return Some(int);
    }
    value
        .as_f64()
        .filter(|float| float.is_finite())
        .map(|float| float.round() as i64)
}

/// Builds `<base><path>?userId=<identity>&version=<version>`.
///
/// Query values are percent-encoded, so identities containing reserved
/// characters survive intact.
pub fn endpoint_url(
    base: &str,
    path: &str,
    identity: &str,
    version: &str,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.set_path(path);
    url.query_pairs_mut()
        .clear()
        .append_pair("userId", identity)
        .append_pair("version", version);
    Ok(url)
}
