//! Relay messages and WebSocket frames.
//!
//! Relay (server bus), one JSON object per channel:
//! ```text
//!   update:        { keyPath, clientId, doc }
//!   delete:        { keyPath, clientId }
//!   add:/remove:   { keyPath, clientId, itemsKeyPath, itemIds }
//!   insertBefore:  { keyPath, clientId, id, itemKeyPath, refId }
//!   deleteItem:    { keyPath, clientId, id }
//! ```
//!
//! Connection frames travel as WebSocket text, tagged by `type`:
//! ```text
//!   client ─► hello { userId, clientId }
//!             observe / unobserve { reqId, keyPath }
//!             request { reqId, op: { verb, keyPath, .. } }
//!   server ─► ready { connectionId }
//!             response { reqId, result: { Ok | Err } }
//!             push { event: { keyPath, notification } }
//! ```

use crate::store::{InsertedItem, Query, SequenceEntry};
use ginger_core::{KeyPath, Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What changed at a key path. The variant name is the relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Notification {
    Update { doc: Value },
    Delete,
    Add { items_key_path: KeyPath, item_ids: Vec<String> },
    Remove { items_key_path: KeyPath, item_ids: Vec<String> },
    InsertBefore { id: String, item_key_path: KeyPath, ref_id: Option<String> },
    DeleteItem { id: String },
}

impl Notification {
    /// Relay channel name without the trailing `:`.
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Update { .. } => "update",
            Notification::Delete => "delete",
            Notification::Add { .. } => "add",
            Notification::Remove { .. } => "remove",
            Notification::InsertBefore { .. } => "insertBefore",
            Notification::DeleteItem { .. } => "deleteItem",
        }
    }
}

/// One message on the relay bus.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub key_path: KeyPath,
    pub client_id: String,
    pub notification: Notification,
}

impl RelayMessage {
    pub fn new(key_path: KeyPath, client_id: impl Into<String>, notification: Notification) -> Self {
        Self { key_path, client_id: client_id.into(), notification }
    }

    /// Channel name, e.g. `update:`.
    pub fn channel(&self) -> String {
        format!("{}:", self.notification.name())
    }

    /// JSON payload: the notification fields plus `keyPath` and `clientId`.
    pub fn encode(&self) -> Result<String> {
        let mut body = match serde_json::to_value(&self.notification)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.remove("type");
        body.insert("keyPath".into(), serde_json::to_value(&self.key_path)?);
        body.insert("clientId".into(), Value::String(self.client_id.clone()));
        Ok(Value::Object(body).to_string())
    }

    /// Parse a payload received on `channel`. `keyPath` must be an array.
    pub fn decode(channel: &str, payload: &str) -> Result<Self> {
        let Value::Object(mut body) = serde_json::from_str::<Value>(payload)? else {
            return Err(SyncError::Protocol(format!("{} payload is not an object", channel)));
        };
        let key_path = match body.remove("keyPath") {
            Some(kp @ Value::Array(_)) => serde_json::from_value(kp)
                .map_err(|e| SyncError::Protocol(format!("bad keyPath on {}: {}", channel, e)))?,
            other => return Err(SyncError::Protocol(format!("keyPath on {} must be an array, got {:?}", channel, other))),
        };
        let client_id = match body.remove("clientId") {
            Some(Value::String(id)) => id,
            _ => return Err(SyncError::Protocol(format!("{} without clientId", channel))),
        };
        let name = channel.trim_end_matches(':');
        body.insert("type".into(), Value::String(name.to_string()));
        let notification = serde_json::from_value(Value::Object(body))
            .map_err(|e| SyncError::Protocol(format!("bad {} payload: {}", channel, e)))?;
        Ok(Self { key_path, client_id, notification })
    }
}

/// A notification delivered to an observing connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub key_path: KeyPath,
    pub notification: Notification,
}

impl PushEvent {
    /// `update:animals:42`, `add:zoo:1:animals`, ...
    pub fn event_name(&self) -> String {
        format!("{}:{}", self.notification.name(), self.key_path.room_key())
    }
}

impl From<RelayMessage> for PushEvent {
    fn from(msg: RelayMessage) -> Self {
        Self { key_path: msg.key_path, notification: msg.notification }
    }
}

/// A store request carried over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    Create { key_path: KeyPath, doc: Value },
    Put { key_path: KeyPath, doc: Value },
    Fetch { key_path: KeyPath },
    Del { key_path: KeyPath },
    Add { key_path: KeyPath, items_key_path: KeyPath, item_ids: Vec<String> },
    Remove { key_path: KeyPath, items_key_path: KeyPath, item_ids: Vec<String> },
    Find { key_path: KeyPath, #[serde(default)] query: Query },
    All { key_path: KeyPath, #[serde(default)] query: Query },
    Next { key_path: KeyPath, id: Option<String> },
    InsertBefore { key_path: KeyPath, ref_id: Option<String>, item_key_path: KeyPath },
    DeleteItem { key_path: KeyPath, id: String },
}

impl Operation {
    /// Key path the operation targets, used for the rights check.
    pub fn key_path(&self) -> &KeyPath {
        match self {
            Operation::Create { key_path, .. }
            | Operation::Put { key_path, .. }
            | Operation::Fetch { key_path }
            | Operation::Del { key_path }
            | Operation::Add { key_path, .. }
            | Operation::Remove { key_path, .. }
            | Operation::Find { key_path, .. }
            | Operation::All { key_path, .. }
            | Operation::Next { key_path, .. }
            | Operation::InsertBefore { key_path, .. }
            | Operation::DeleteItem { key_path, .. } => key_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Unit,
    Id(String),
    Doc(Value),
    Docs(Vec<Value>),
    Entries(Vec<SequenceEntry>),
    Entry(Option<SequenceEntry>),
    Inserted(InsertedItem),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Hello { user_id: String, client_id: String },
    Observe { req_id: u64, key_path: KeyPath },
    Unobserve { req_id: u64, key_path: KeyPath },
    Request { req_id: u64, op: Operation },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Ready { connection_id: String },
    Response { req_id: u64, result: std::result::Result<Reply, SyncError> },
    Push { event: PushEvent },
}

macro_rules! json_frame {
    ($ty:ty) => {
        impl $ty {
            pub fn encode(&self) -> Result<String> {
                Ok(serde_json::to_string(self)?)
            }

            pub fn decode(text: &str) -> Result<Self> {
                serde_json::from_str(text).map_err(|e| SyncError::Protocol(e.to_string()))
            }
        }
    };
}

json_frame!(ClientFrame);
json_frame!(ServerFrame);
