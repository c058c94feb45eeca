//! Wire envelopes: JSON objects as UTF-8 text.
//!
//! Control envelopes carry a reserved `__type__` key (`"ping"` / `"pong"`)
//! and are handled by the hub itself. Everything else belongs to the
//! application.

use super::message::JsonMap;
use crate::error::CuemsResult;
use serde_json::Value;

/// Reserved key marking control envelopes
pub const TYPE_KEY: &str = "__type__";
/// Key under which undecodable traffic is delivered
pub const RAW_DATA_KEY: &str = "raw_data";

pub const PING_TYPE: &str = "ping";
pub const PONG_TYPE: &str = "pong";

/// ISO-8601 local time without zone, microsecond precision
pub fn timestamp_now() -> String {
    chrono::Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

pub fn encode(data: &JsonMap) -> CuemsResult<String> {
    Ok(serde_json::to_string(data)?)
}

/// Decode a received frame. Never fails: text that is not a JSON object is
/// delivered as `{"raw_data": <text>}`.
pub fn decode(bytes: &[u8]) -> JsonMap {
    let text = String::from_utf8_lossy(bytes);
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(data)) => data,
        _ => {
            let mut data = JsonMap::new();
            data.insert(RAW_DATA_KEY.to_string(), Value::String(text.into_owned()));
            data
        }
    }
}

/// Hub-internal heartbeat envelopes
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEnvelope {
    Ping { timestamp: Value },
    Pong { timestamp: Value, ping_timestamp: Value },
}

/// Recognise a ping or pong. Unknown or non-string `__type__` values fall through.
pub fn classify(data: &JsonMap) -> Option<ControlEnvelope> {
    let field = |key: &str| data.get(key).cloned().unwrap_or(Value::Null);

    match data.get(TYPE_KEY).and_then(Value::as_str) {
        Some(PING_TYPE) => Some(ControlEnvelope::Ping {
            timestamp: field("timestamp"),
        }),
        Some(PONG_TYPE) => Some(ControlEnvelope::Pong {
            timestamp: field("timestamp"),
            ping_timestamp: field("ping_timestamp"),
        }),
        _ => None,
    }
}

pub fn ping(timestamp: String) -> JsonMap {
    let mut data = JsonMap::new();
    data.insert(TYPE_KEY.to_string(), Value::from(PING_TYPE));
    data.insert("timestamp".to_string(), Value::String(timestamp));
    data
}

pub fn pong(timestamp: String, ping_timestamp: Value) -> JsonMap {
    let mut data = JsonMap::new();
    data.insert(TYPE_KEY.to_string(), Value::from(PONG_TYPE));
    data.insert("timestamp".to_string(), Value::String(timestamp));
    data.insert("ping_timestamp".to_string(), ping_timestamp);
    data
}
