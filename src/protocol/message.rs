//! Wire messages
//!
//! Every frame is a single JSON object discriminated by `messageType`. The
//! one exception is ping, which is the empty object `{}` in both directions.
//!
//! Decoding goes through [`serde_json::Value`] and a dedicated decoder per
//! message kind, so a frame with an unknown `messageType` is rejected before
//! any field is looked at.

use super::Uaid;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

const MESSAGE_TYPE_FIELD: &str = "messageType";
const UAID_FIELD: &str = "uaid";
const CHANNEL_IDS_FIELD: &str = "channelIDs";
const CHANNEL_ID_FIELD: &str = "channelID";
const STATUS_FIELD: &str = "status";
const PUSH_ENDPOINT_FIELD: &str = "pushEndpoint";
const UPDATES_FIELD: &str = "updates";
const VERSION_FIELD: &str = "version";

/// Errors produced while decoding a frame
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing messageType")]
    MissingType,

    #[error("unknown messageType '{0}'")]
    UnknownType(String),

    #[error("missing or invalid field '{0}'")]
    MissingField(&'static str),

    #[error("unexpected {0} message")]
    Unexpected(MessageType),
}

/// The six message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Register,
    Unregister,
    Ack,
    Notification,
    Ping,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::Register => "register",
            MessageType::Unregister => "unregister",
            MessageType::Ack => "ack",
            MessageType::Notification => "notification",
            MessageType::Ping => "ping",
        }
    }

    /// Parse a `messageType` value (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hello" => Some(MessageType::Hello),
            "register" => Some(MessageType::Register),
            "unregister" => Some(MessageType::Unregister),
            "ack" => Some(MessageType::Ack),
            "notification" => Some(MessageType::Notification),
            "ping" => Some(MessageType::Ping),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes carried in register/unregister replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u16)]
pub enum Status {
    Ok = 200,
    Conflict = 409,
    ServerError = 500,
}

impl Status {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            409 => Some(Status::Conflict),
            500 => Some(Status::ServerError),
            _ => None,
        }
    }
}

/// A `(channelID, version)` pair as carried in `ack` and `notification`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub version: u64,
}

impl Update {
    pub fn new(channel_id: impl Into<String>, version: u64) -> Self {
        Self {
            channel_id: channel_id.into(),
            version,
        }
    }
}

/// Messages a user agent sends to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello {
        uaid: Option<String>,
        channel_ids: HashSet<String>,
    },
    Register {
        channel_id: String,
    },
    Unregister {
        channel_id: String,
    },
    Ack {
        updates: HashSet<Update>,
    },
    Ping,
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Hello { .. } => MessageType::Hello,
            Request::Register { .. } => MessageType::Register,
            Request::Unregister { .. } => MessageType::Unregister,
            Request::Ack { .. } => MessageType::Ack,
            Request::Ping => MessageType::Ping,
        }
    }

    /// Decode a client frame
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let (kind, obj) = match split_frame(raw)? {
            Some(parts) => parts,
            None => return Ok(Request::Ping),
        };

        match kind {
            MessageType::Hello => decode_hello(&obj),
            MessageType::Register => Ok(Request::Register {
                channel_id: required_str(&obj, CHANNEL_ID_FIELD)?,
            }),
            MessageType::Unregister => Ok(Request::Unregister {
                channel_id: required_str(&obj, CHANNEL_ID_FIELD)?,
            }),
            MessageType::Ack => Ok(Request::Ack {
                updates: decode_updates(&obj)?,
            }),
            MessageType::Ping => Ok(Request::Ping),
            MessageType::Notification => Err(CodecError::Unexpected(kind)),
        }
    }

    /// Encode as a client would send it
    pub fn encode(&self) -> String {
        let value = match self {
            Request::Hello { uaid, channel_ids } => {
                let mut ids: Vec<&String> = channel_ids.iter().collect();
                ids.sort();
                let mut obj = Map::new();
                obj.insert(MESSAGE_TYPE_FIELD.into(), json!(MessageType::Hello.as_str()));
                if let Some(uaid) = uaid {
                    obj.insert(UAID_FIELD.into(), json!(uaid));
                }
                obj.insert(CHANNEL_IDS_FIELD.into(), json!(ids));
                Value::Object(obj)
            }
            Request::Register { channel_id } => json!({
                MESSAGE_TYPE_FIELD: MessageType::Register.as_str(),
                CHANNEL_ID_FIELD: channel_id,
            }),
            Request::Unregister { channel_id } => json!({
                MESSAGE_TYPE_FIELD: MessageType::Unregister.as_str(),
                CHANNEL_ID_FIELD: channel_id,
            }),
            Request::Ack { updates } => json!({
                MESSAGE_TYPE_FIELD: MessageType::Ack.as_str(),
                UPDATES_FIELD: sorted(updates),
            }),
            Request::Ping => json!({}),
        };
        value.to_string()
    }
}

/// Messages the server sends to a user agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Hello {
        uaid: Uaid,
    },
    Register {
        channel_id: String,
        status: Status,
        push_endpoint: String,
    },
    Unregister {
        channel_id: String,
        status: Status,
    },
    Notification {
        updates: HashSet<Update>,
    },
    Ping,
}

impl Reply {
    pub fn message_type(&self) -> MessageType {
        match self {
            Reply::Hello { .. } => MessageType::Hello,
            Reply::Register { .. } => MessageType::Register,
            Reply::Unregister { .. } => MessageType::Unregister,
            Reply::Notification { .. } => MessageType::Notification,
            Reply::Ping => MessageType::Ping,
        }
    }

    pub fn encode(&self) -> String {
        let value = match self {
            Reply::Hello { uaid } => json!({
                MESSAGE_TYPE_FIELD: MessageType::Hello.as_str(),
                UAID_FIELD: uaid.to_string(),
            }),
            Reply::Register {
                channel_id,
                status,
                push_endpoint,
            } => json!({
                MESSAGE_TYPE_FIELD: MessageType::Register.as_str(),
                CHANNEL_ID_FIELD: channel_id,
                STATUS_FIELD: status,
                PUSH_ENDPOINT_FIELD: push_endpoint,
            }),
            Reply::Unregister { channel_id, status } => json!({
                MESSAGE_TYPE_FIELD: MessageType::Unregister.as_str(),
                CHANNEL_ID_FIELD: channel_id,
                STATUS_FIELD: status,
            }),
            Reply::Notification { updates } => json!({
                MESSAGE_TYPE_FIELD: MessageType::Notification.as_str(),
                UPDATES_FIELD: sorted(updates),
            }),
            Reply::Ping => json!({}),
        };
        value.to_string()
    }

    /// Decode a server frame (client side and tests)
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let (kind, obj) = match split_frame(raw)? {
            Some(parts) => parts,
            None => return Ok(Reply::Ping),
        };

        match kind {
            MessageType::Hello => {
                let uaid = required_str(&obj, UAID_FIELD)?;
                let uaid = Uaid::parse(&uaid).ok_or(CodecError::MissingField(UAID_FIELD))?;
                Ok(Reply::Hello { uaid })
            }
            MessageType::Register => Ok(Reply::Register {
                channel_id: required_str(&obj, CHANNEL_ID_FIELD)?,
                status: required_status(&obj)?,
                // empty when registration failed with 500
                push_endpoint: obj
                    .get(PUSH_ENDPOINT_FIELD)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            MessageType::Unregister => Ok(Reply::Unregister {
                channel_id: required_str(&obj, CHANNEL_ID_FIELD)?,
                status: required_status(&obj)?,
            }),
            MessageType::Notification => Ok(Reply::Notification {
                updates: decode_updates(&obj)?,
            }),
            MessageType::Ping => Ok(Reply::Ping),
            MessageType::Ack => Err(CodecError::Unexpected(kind)),
        }
    }
}

/// Parse the frame and read its discriminant. `None` means ping (`{}`).
fn split_frame(raw: &str) -> Result<Option<(MessageType, Map<String, Value>)>, CodecError> {
    let value: Value = serde_json::from_str(raw)?;
    let obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(CodecError::NotAnObject),
    };

    if obj.is_empty() {
        return Ok(None);
    }

    let kind = match obj.get(MESSAGE_TYPE_FIELD) {
        Some(Value::String(s)) => {
            MessageType::parse(s).ok_or_else(|| CodecError::UnknownType(s.clone()))?
        }
        Some(_) | None => return Err(CodecError::MissingType),
    };

    Ok(Some((kind, obj)))
}

fn decode_hello(obj: &Map<String, Value>) -> Result<Request, CodecError> {
    let uaid = obj
        .get(UAID_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string);

    let channel_ids = match obj.get(CHANNEL_IDS_FIELD) {
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        _ => HashSet::new(),
    };

    Ok(Request::Hello { uaid, channel_ids })
}

fn decode_updates(obj: &Map<String, Value>) -> Result<HashSet<Update>, CodecError> {
    let entries = obj
        .get(UPDATES_FIELD)
        .and_then(Value::as_array)
        .ok_or(CodecError::MissingField(UPDATES_FIELD))?;

    entries
        .iter()
        .map(|entry| {
            let entry = entry
                .as_object()
                .ok_or(CodecError::MissingField(UPDATES_FIELD))?;
            let channel_id = required_str(entry, CHANNEL_ID_FIELD)?;
            let version = entry
                .get(VERSION_FIELD)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Ok(Update::new(channel_id, version))
        })
        .collect()
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, CodecError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(CodecError::MissingField(field)),
    }
}

fn required_status(obj: &Map<String, Value>) -> Result<Status, CodecError> {
    obj.get(STATUS_FIELD)
        .and_then(Value::as_u64)
        .and_then(Status::from_code)
        .ok_or(CodecError::MissingField(STATUS_FIELD))
}

fn sorted(updates: &HashSet<Update>) -> Vec<&Update> {
    let mut list: Vec<&Update> = updates.iter().collect();
    list.sort();
    list
}
