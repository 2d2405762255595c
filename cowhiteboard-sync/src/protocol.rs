//! JSON wire protocol spoken with the room relay.
//!
//! Every frame is a JSON text message tagged by its `type` field:
//! ```text
//! client → relay   { "type": "update",     "changes": ChangeSet, "data": RecordMap }
//!                  { "type": "snapshot",   "data": RecordMap }
//!
//! relay → client   { "type": "init",       "snapshot"?: RecordMap | null, "userCount"?: n }
//!                  { "type": "update",     "changes": ChangeSet }
//!                  { "type": "user_count", "count": n }
//! ```
//!
//! Unknown fields are ignored. Unknown `type` values decode to
//! [`ServerMessage::Other`] so that callers can drop them without treating
//! them as malformed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Identifier of one document record, e.g. `"shape:abc"`.
pub type RecordId = String;

/// One opaque unit of document state. Never decoded by this crate.
pub type Record = Value;

/// Mapping from record id to full record.
pub type RecordMap = BTreeMap<RecordId, Record>;

/// Opaque room name, used only as the last path segment of the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Treats an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts any JSON for an optional record map. Anything other than an object
/// decodes to `None` so the rest of the frame survives.
fn lenient_record_map<'de, D>(deserializer: D) -> Result<Option<RecordMap>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Object(map)) => Ok(Some(map.into_iter().collect())),
        None | Some(Value::Null) => Ok(None),
        Some(other) => {
            log::warn!("Ignoring snapshot that is not an object: {other}");
            Ok(None)
        }
    }
}

/// A delta over document records.
///
/// `updated` carries `[old, new]` pairs; only the new value is ever applied.
/// `removed` values are informational (`true` on the wire) and only the keys
/// matter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default, deserialize_with = "null_as_default")]
    pub added: RecordMap,
    #[serde(default, deserialize_with = "null_as_default")]
    pub updated: BTreeMap<RecordId, (Record, Record)>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub removed: BTreeMap<RecordId, Value>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<RecordId>, record: Record) -> &mut Self {
        self.added.insert(id.into(), record);
        self
    }

    pub fn update(&mut self, id: impl Into<RecordId>, old: Record, new: Record) -> &mut Self {
        self.updated.insert(id.into(), (old, new));
        self
    }

    pub fn remove(&mut self, id: impl Into<RecordId>) -> &mut Self {
        self.removed.insert(id.into(), Value::Bool(true));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Total number of record ids touched.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// Records that should be upserted: every `added` record plus the new
    /// half of every `updated` pair.
    pub fn upserts(&self) -> RecordMap {
        let mut out = self.added.clone();
        out.extend(
            self.updated
                .iter()
                .map(|(id, (_, new))| (id.clone(), new.clone())),
        );
        out
    }

    /// Ids that should be deleted.
    pub fn removed_ids(&self) -> Vec<RecordId> {
        self.removed.keys().cloned().collect()
    }

    /// Checks that no id appears in more than one of the three mappings.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let overlap = |first: &'static str, second: &'static str, id: &RecordId| {
            ProtocolError::OverlappingRecord {
                id: id.clone(),
                first,
                second,
            }
        };

        for id in self.added.keys() {
            if self.updated.contains_key(id) {
                return Err(overlap("added", "updated", id));
            }
            if self.removed.contains_key(id) {
                return Err(overlap("added", "removed", id));
            }
        }
        for id in self.updated.keys() {
            if self.removed.contains_key(id) {
                return Err(overlap("updated", "removed", id));
            }
        }
        Ok(())
    }

    /// Split into one change set per key, keeping the `added` / `updated` /
    /// `removed` placement of every id.
    pub fn partition<K, F>(&self, mut key_of: F) -> BTreeMap<K, ChangeSet>
    where
        K: Ord,
        F: FnMut(&str) -> K,
    {
        let mut parts: BTreeMap<K, ChangeSet> = BTreeMap::new();
        for (id, record) in &self.added {
            parts
                .entry(key_of(id))
                .or_default()
                .added
                .insert(id.clone(), record.clone());
        }
        for (id, pair) in &self.updated {
            parts
                .entry(key_of(id))
                .or_default()
                .updated
                .insert(id.clone(), pair.clone());
        }
        for (id, flag) in &self.removed {
            parts
                .entry(key_of(id))
                .or_default()
                .removed
                .insert(id.clone(), flag.clone());
        }
        parts
    }
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once right after joining a room.
    Init {
        #[serde(
            default,
            deserialize_with = "lenient_record_map",
            skip_serializing_if = "Option::is_none"
        )]
        snapshot: Option<RecordMap>,
        #[serde(default, rename = "userCount", skip_serializing_if = "Option::is_none")]
        user_count: Option<u64>,
    },
    /// A change set another member of the room published.
    Update { changes: ChangeSet },
    /// Room membership changed.
    UserCount { count: u64 },
    /// Any `type` this client does not understand.
    #[serde(other)]
    Other,
}

impl ServerMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Decode one binary frame holding UTF-8 JSON.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Wire name of the frame type, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Update { .. } => "update",
            Self::UserCount { .. } => "user_count",
            Self::Other => "other",
        }
    }
}

/// Frames sent by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A local edit, with the full document state for relay-side persistence.
    Update { changes: ChangeSet, data: RecordMap },
    /// Ask the relay to persist `data` right away.
    Snapshot { data: RecordMap },
}

impl ClientMessage {
    pub fn update(changes: ChangeSet, data: RecordMap) -> Self {
        Self::Update { changes, data }
    }

    pub fn snapshot(data: RecordMap) -> Self {
        Self::Snapshot { data }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::Snapshot { .. } => "snapshot",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Record {id} appears in both `{first}` and `{second}`")]
    OverlappingRecord {
        id: RecordId,
        first: &'static str,
        second: &'static str,
    },
}
