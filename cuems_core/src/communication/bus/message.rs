use crate::error::{CuemsError, CuemsResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Decoded JSON object carried by a message
pub type JsonMap = Map<String, Value>;

/// Who sent a message on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderId {
    /// Routable peer (TCP)
    Addr { ip: String, port: u16 },
    /// Peer without a routable address: socket URL, or "unknown"
    Opaque(String),
}

impl SenderId {
    pub fn addr(ip: impl Into<String>, port: u16) -> Self {
        SenderId::Addr {
            ip: ip.into(),
            port,
        }
    }

    pub fn opaque(descriptor: impl Into<String>) -> Self {
        SenderId::Opaque(descriptor.into())
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderId::Addr { ip, port } if ip.contains(':') => write!(f, "[{}]:{}", ip, port),
            SenderId::Addr { ip, port } => write!(f, "{}:{}", ip, port),
            SenderId::Opaque(descriptor) => f.write_str(descriptor),
        }
    }
}

/// Application message received from the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub data: JsonMap,
    pub sender: SenderId,
}

impl Message {
    pub fn new(data: JsonMap, sender: SenderId) -> Self {
        Self { data, sender }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Anything `send_message` accepts, resolved once at the call site
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(JsonMap),
    /// A received message being re-sent; only its data goes on the wire
    Wrapped(Message),
}

impl Payload {
    pub fn into_data(self) -> JsonMap {
        match self {
            Payload::Raw(data) => data,
            Payload::Wrapped(message) => message.data,
        }
    }

    pub fn data(&self) -> &JsonMap {
        match self {
            Payload::Raw(data) => data,
            Payload::Wrapped(message) => &message.data,
        }
    }

    /// JSON text as written to the transport
    pub fn encode(&self) -> CuemsResult<String> {
        Ok(serde_json::to_string(self.data())?)
    }
}

impl From<JsonMap> for Payload {
    fn from(data: JsonMap) -> Self {
        Payload::Raw(data)
    }
}

impl From<Message> for Payload {
    fn from(message: Message) -> Self {
        Payload::Wrapped(message)
    }
}

impl TryFrom<Value> for Payload {
    type Error = CuemsError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(data) => Ok(Payload::Raw(data)),
            other => Err(CuemsError::invalid_payload(format!(
                "send_message requires a JSON object or Message, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
