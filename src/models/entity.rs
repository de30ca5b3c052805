//! Synced entity types and their validity rules.
//!
//! Every entity carries a client-generated `id` and a wall-clock `ts`
//! in milliseconds. Across hosts the larger `ts` wins; entries that
//! fail [`Syncable::is_valid`] are dropped before merging instead of
//! being propagated.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::document::{Collection, Document};

/// Common surface the merge and mutation paths need from an entity.
pub trait Syncable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn collection() -> Collection;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn ts(&self) -> i64;
    fn set_ts(&mut self, ts: i64);
    fn name(&self) -> &str;

    /// Whether this entry may take part in a merge. Invalid entries are
    /// dropped with a warning, never merged or written back.
    fn is_valid(&self) -> bool;

    /// Timestamp of the same-id entry in a host document, if present.
    fn find_ts(doc: &Document, id: &str) -> Option<i64>;
}

fn usable_id(id: &str) -> bool {
    !id.is_empty() && id != "0" && id != "null"
}

fn usable_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty() && trimmed != "null"
}

/// A stored color configuration for a single controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Preset {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub color: Value,
    /// Local-only flag; never pushed to controllers.
    #[serde(default, skip_serializing)]
    pub favorite: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Preset {
    pub fn new(name: impl Into<String>, color: Value) -> Self {
        Self {
            name: name.into(),
            color,
            ..Self::default()
        }
    }
}

impl Syncable for Preset {
    fn collection() -> Collection {
        Collection::Presets
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn ts(&self) -> i64 {
        self.ts
    }

    fn set_ts(&mut self, ts: i64) {
        self.ts = ts;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        usable_id(&self.id) && usable_name(&self.name) && self.ts > 0 && self.color.is_object()
    }

    fn find_ts(doc: &Document, id: &str) -> Option<i64> {
        doc.presets.iter().find(|p| p.id == id).map(|p| p.ts)
    }
}

/// Per-controller settings inside a scene.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SceneSetting {
    #[serde(default)]
    pub controller_id: Option<String>,
    #[serde(flatten)]
    pub settings: serde_json::Map<String, Value>,
}

impl SceneSetting {
    pub fn has_controller(&self) -> bool {
        self.controller_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// A coordinated look across several controllers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Scene {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub settings: Vec<SceneSetting>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Scene {
    pub fn new(name: impl Into<String>, settings: Vec<SceneSetting>) -> Self {
        Self {
            name: name.into(),
            settings,
            ..Self::default()
        }
    }

    /// Settings that reference a usable controller id.
    pub fn usable_settings(&self) -> impl Iterator<Item = &SceneSetting> {
        self.settings.iter().filter(|s| s.has_controller())
    }
}

impl Syncable for Scene {
    fn collection() -> Collection {
        Collection::Scenes
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn ts(&self) -> i64 {
        self.ts
    }

    fn set_ts(&mut self, ts: i64) {
        self.ts = ts;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        usable_id(&self.id) && usable_name(&self.name) && self.ts > 0 && !self.settings.is_empty()
    }

    fn find_ts(doc: &Document, id: &str) -> Option<i64> {
        doc.scenes.iter().find(|s| s.id == id).map(|s| s.ts)
    }
}

/// A named set of controllers addressed together.
///
/// `controller_ids` may contain nulls from older firmwares; those
/// entries are preserved on the wire but ignored everywhere else.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Group {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub controller_ids: Vec<Option<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Group {
    pub fn new(name: impl Into<String>, controller_ids: Vec<String>) -> Self {
        Self {
            name: name.into(),
            controller_ids: controller_ids.into_iter().map(Some).collect(),
            ..Self::default()
        }
    }

    /// Controller ids that are present and non-empty.
    pub fn usable_controller_ids(&self) -> impl Iterator<Item = &str> {
        self.controller_ids
            .iter()
            .filter_map(|id| id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

impl Syncable for Group {
    fn collection() -> Collection {
        Collection::Groups
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn ts(&self) -> i64 {
        self.ts
    }

    fn set_ts(&mut self, ts: i64) {
        self.ts = ts;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_valid(&self) -> bool {
        usable_id(&self.id)
            && usable_name(&self.name)
            && self.ts > 0
            && self.usable_controller_ids().next().is_some()
    }

    fn find_ts(doc: &Document, id: &str) -> Option<i64> {
        doc.groups.iter().find(|g| g.id == id).map(|g| g.ts)
    }
}

/// Synced metadata about a controller (display name, placement, …),
/// distinct from the directory's reachability records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerMeta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub name: String,
    /// Zero is allowed: freshly discovered controllers have never been
    /// edited.
    #[serde(default)]
    pub ts: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Syncable for ControllerMeta {
    fn collection() -> Collection {
        Collection::Controllers
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn ts(&self) -> i64 {
        self.ts
    }

    fn set_ts(&mut self, ts: i64) {
        self.ts = ts;
    }

    fn name(&self) -> &str {
        if self.name.is_empty() {
            &self.hostname
        } else {
            &self.name
        }
    }

    fn is_valid(&self) -> bool {
        usable_id(&self.id)
            && (usable_name(&self.hostname) || usable_name(&self.name))
            && self.ts >= 0
    }

    fn find_ts(doc: &Document, id: &str) -> Option<i64> {
        doc.controllers.iter().find(|c| c.id == id).map(|c| c.ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_preset() -> Preset {
        Preset {
            id: "c1-10000001".into(),
            name: "warm white".into(),
            ts: 100,
            color: json!({"r": 255, "g": 180, "b": 120}),
            favorite: false,
            extra: Default::default(),
        }
    }

    #[test]
    fn test_preset_validity() {
        assert!(valid_preset().is_valid());

        let mut p = valid_preset();
        p.id = "0".into();
        assert!(!p.is_valid());

        let mut p = valid_preset();
        p.name = "  ".into();
        assert!(!p.is_valid());

        let mut p = valid_preset();
        p.ts = 0;
        assert!(!p.is_valid());

        let mut p = valid_preset();
        p.color = Value::Null;
        assert!(!p.is_valid());
    }

    #[test]
    fn test_favorite_never_serializes() {
        let mut p = valid_preset();
        p.favorite = true;
        let wire = serde_json::to_value(&p).unwrap();
        assert!(wire.get("favorite").is_none());
    }

    #[test]
    fn test_preset_preserves_unknown_fields() {
        let p: Preset = serde_json::from_value(json!({
            "id": "x", "name": "n", "ts": 5,
            "color": {}, "brightness": 40
        }))
        .unwrap();
        assert_eq!(p.extra["brightness"], 40);
        let wire = serde_json::to_value(&p).unwrap();
        assert_eq!(wire["brightness"], 40);
    }

    #[test]
    fn test_scene_requires_settings() {
        let mut s = Scene::new("movie night", vec![]);
        s.id = "s1".into();
        s.ts = 10;
        assert!(!s.is_valid());

        s.settings.push(SceneSetting {
            controller_id: Some("c1".into()),
            settings: Default::default(),
        });
        assert!(s.is_valid());
    }

    #[test]
    fn test_group_null_controller_ids_are_ignored() {
        let g: Group = serde_json::from_value(json!({
            "id": "g1", "name": "hall", "ts": 9,
            "controller_ids": [null, "c2", ""]
        }))
        .unwrap();
        assert_eq!(g.usable_controller_ids().collect::<Vec<_>>(), vec!["c2"]);
        assert!(g.is_valid());

        let empty: Group = serde_json::from_value(json!({
            "id": "g2", "name": "attic", "ts": 9,
            "controller_ids": [null, null]
        }))
        .unwrap();
        assert!(!empty.is_valid());
    }

    #[test]
    fn test_controller_meta_allows_zero_ts() {
        let m: ControllerMeta = serde_json::from_value(json!({
            "id": "c1", "hostname": "lamp-1", "ts": 0
        }))
        .unwrap();
        assert!(m.is_valid());

        let unnamed: ControllerMeta = serde_json::from_value(json!({
            "id": "c2", "ts": 0
        }))
        .unwrap();
        assert!(!unnamed.is_valid());
    }

    #[test]
    fn test_find_ts_in_document() {
        let mut doc = Document::default();
        doc.presets.push(valid_preset());
        assert_eq!(Preset::find_ts(&doc, "c1-10000001"), Some(100));
        assert_eq!(Preset::find_ts(&doc, "missing"), None);
    }
}
