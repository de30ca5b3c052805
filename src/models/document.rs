//! The shared per-host document and its partial-update payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::{ControllerMeta, Group, Preset, Scene};

/// Full state one controller serves at `GET /data`.
///
/// The controller owns this; any copy held by a client may be stale.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub controllers: Vec<ControllerMeta>,
    #[serde(rename = "sync-lock", default, skip_serializing_if = "Option::is_none")]
    pub sync_lock: Option<SyncLock>,
    #[serde(rename = "last-color", default, skip_serializing_if = "Value::is_null")]
    pub last_color: Value,
}

/// Advisory write-exclusion marker stored inside the shared document.
///
/// An empty `id` means unlocked. Any client may override a lock whose
/// age exceeds the configured staleness threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncLock {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ts: i64,
}

impl SyncLock {
    pub fn held_by(id: impl Into<String>, ts: i64) -> Self {
        Self { id: id.into(), ts }
    }

    /// The cleared lock written on release.
    pub fn released() -> Self {
        Self {
            id: String::new(),
            ts: 0,
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.id.is_empty()
    }

    pub fn is_stale(&self, now_ms: i64, stale_after_ms: i64) -> bool {
        now_ms.saturating_sub(self.ts) >= stale_after_ms
    }

    /// Whether this lock prevents `self_id` from acquiring: held by
    /// someone else and still fresh.
    pub fn blocks(&self, self_id: &str, now_ms: i64, stale_after_ms: i64) -> bool {
        !self.is_unlocked() && self.id != self_id && !self.is_stale(now_ms, stale_after_ms)
    }
}

/// The four synced collections of the shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Presets,
    Scenes,
    Groups,
    Controllers,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Presets,
        Collection::Scenes,
        Collection::Groups,
        Collection::Controllers,
    ];

    /// Document key for this collection.
    pub fn key(&self) -> &'static str {
        match self {
            Collection::Presets => "presets",
            Collection::Scenes => "scenes",
            Collection::Groups => "groups",
            Collection::Controllers => "controllers",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Partial update for `POST /data`.
///
/// The host interprets the selector key; the client's only contract is
/// to send well-formed JSON and expect a 2xx. Selectors are built from
/// the known [`Collection`]s, so an unknown collection or a free-form
/// path is unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    body: serde_json::Map<String, Value>,
}

impl Patch {
    /// Replace the entry with the given id: `presets[id=X]: {…}`.
    pub fn replace<T: Serialize>(
        collection: Collection,
        id: &str,
        entity: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut body = serde_json::Map::new();
        body.insert(
            format!("{}[id={}]", collection.key(), id),
            serde_json::to_value(entity)?,
        );
        Ok(Self { body })
    }

    /// Append a new entry: `presets[]: [{…}]`.
    pub fn append<T: Serialize>(collection: Collection, entity: &T) -> Result<Self, serde_json::Error> {
        let mut body = serde_json::Map::new();
        body.insert(
            format!("{}[]", collection.key()),
            Value::Array(vec![serde_json::to_value(entity)?]),
        );
        Ok(Self { body })
    }

    /// Remove the entry with the given id: `presets[id=X]: []`.
    pub fn remove(collection: Collection, id: &str) -> Self {
        let mut body = serde_json::Map::new();
        body.insert(
            format!("{}[id={}]", collection.key(), id),
            Value::Array(Vec::new()),
        );
        Self { body }
    }

    /// Write the sync lock field.
    pub fn set_lock(lock: &SyncLock) -> Self {
        let mut body = serde_json::Map::new();
        // serializing a plain struct with string/int fields cannot fail
        body.insert(
            "sync-lock".to_string(),
            serde_json::to_value(lock).unwrap_or(Value::Null),
        );
        Self { body }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}
