use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// An untyped character-state mapping. The recognized shape is declared
/// per-story by [`CharacterSchema`]; unknown scalar keys are still accepted
/// and stored verbatim (§4.9, forward-compatibility by design).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterState(pub Map<String, Value>);

impl CharacterState {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn reward_points(&self) -> i64 {
        self.0
            .get("reward_points")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn string_field(&self, key: &str) -> &str {
        self.0.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

/// Scalar field type declared in a story's character schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
}

/// Shape of a list-typed schema field: either an ordered sequence (with
/// `_add`/`_remove` STATE-tag keys) or a map merged by whole-object
/// replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    #[default]
    List,
    Map,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListDef {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub list_type: ListType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_add_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_remove_key: Option<String>,
}

/// Per-story declaration of the recognized character-state shape (§3).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterSchema {
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub lists: Vec<ListDef>,
    #[serde(default)]
    pub direct_overwrite_keys: Vec<String>,
}

impl CharacterSchema {
    /// All keys a STATE update may legitimately touch: scalar fields, list
    /// keys plus their `_add`/`_remove` companions, direct-overwrite keys,
    /// and the two reward-point spellings. Used to find "unknown" keys that
    /// trigger background normalization (§4.9).
    pub fn known_keys(&self) -> HashSet<String> {
        let mut known = HashSet::new();
        for f in &self.fields {
            known.insert(f.key.clone());
        }
        for l in &self.lists {
            known.insert(l.key.clone());
            if let Some(k) = &l.state_add_key {
                known.insert(k.clone());
            }
            if let Some(k) = &l.state_remove_key {
                known.insert(k.clone());
            }
        }
        for k in &self.direct_overwrite_keys {
            known.insert(k.clone());
        }
        known.insert("reward_points_delta".to_string());
        known.insert("reward_points".to_string());
        known
    }

    pub fn list_def(&self, key: &str) -> Option<&ListDef> {
        self.lists.iter().find(|l| l.key == key)
    }
}
