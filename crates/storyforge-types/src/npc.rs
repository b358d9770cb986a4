use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Active,
    Archived,
}

impl Default for LifecycleStatus {
    fn default() -> Self {
        Self::Active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openness: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conscientiousness: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraversion: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreeableness: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neuroticism: Option<i64>,
    #[serde(default)]
    pub summary: String,
}

/// An NPC record. Identity is by name, matched case- and
/// punctuation-insensitively after NFKC normalization (see
/// `storyforge-engine::npc::normalize_name`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Npc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub appearance: String,
    #[serde(default)]
    pub personality: Personality,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub current_status: String,
    #[serde(default)]
    pub notable_traits: Vec<String>,
    #[serde(default)]
    pub relationship_to_player: RelationshipValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default)]
    pub lifecycle_status: LifecycleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_reason: Option<String>,
    /// Any fields a model sends that aren't part of the recognized shape;
    /// preserved so a merge-by-name upsert doesn't silently drop them.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// `relationship_to_player` (and a relationship entry in character state)
/// may arrive as either a bare string or `{summary|description|type}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipValue {
    Text(String),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl Default for RelationshipValue {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl RelationshipValue {
    /// Collapses a dict-shaped relationship value to its display string,
    /// mirroring `state_db._rel_to_str`.
    pub fn as_display(&self) -> String {
        match self {
            RelationshipValue::Text(s) => s.trim().to_string(),
            RelationshipValue::Detailed {
                summary,
                description,
                kind,
            } => summary
                .clone()
                .or_else(|| description.clone())
                .or_else(|| kind.clone())
                .unwrap_or_default()
                .trim()
                .to_string(),
        }
    }
}
