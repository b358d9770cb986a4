//! Character schema loading and the sample schema/state shipped for new
//! stories that haven't authored their own yet.

use serde_json::{json, Value};
use storyforge_core::{read_json_or_default, Result, Workspace};
use storyforge_types::{CharacterSchema, CharacterState, FieldType, ListType, StoryId};

/// Loads a story's character schema, falling back to [`default_schema`] if
/// the story hasn't authored `character_schema.json` yet. Mirrors the
/// original's `_load_json(path, DEFAULT_CHARACTER_SCHEMA)`.
pub fn load_schema(ws: &Workspace, story: &StoryId) -> Result<CharacterSchema> {
    let path = ws.story_design(story).character_schema();
    if !path.exists() {
        return Ok(default_schema());
    }
    read_json_or_default(&path)
}

/// The schema shown in a freshly scaffolded story: an isekai-reincarnation
/// character sheet (name/gene lock/physique/spirit/reward points/status,
/// inventory, completed missions, relationships).
pub fn default_schema() -> CharacterSchema {
    serde_json::from_value(json!({
        "fields": [
            {"key": "name", "label": "姓名", "type": "text"},
            {"key": "gene_lock", "label": "基因鎖", "type": "text"},
            {"key": "physique", "label": "體質", "type": "text"},
            {"key": "spirit", "label": "精神力", "type": "text"},
            {"key": "reward_points", "label": "獎勵點", "type": "number"},
            {"key": "current_status", "label": "狀態", "type": "text"},
        ],
        "lists": [
            {"key": "inventory", "label": "道具欄", "type": "list", "state_add_key": "inventory_add", "state_remove_key": "inventory_remove"},
            {"key": "completed_missions", "label": "已完成任務", "type": "list", "state_add_key": "completed_missions_add"},
            {"key": "relationships", "label": "人際關係", "type": "map"},
        ],
        "direct_overwrite_keys": ["gene_lock", "physique", "spirit", "current_status"],
    }))
    .expect("default schema is valid")
}

/// Builds a placeholder character state from a schema: `0`/`"—"` for scalar
/// fields depending on declared type, `[]`/`{}` for list/map fields.
pub fn blank_character_state(schema: &CharacterSchema) -> CharacterState {
    let mut state = CharacterState::new();
    for field in &schema.fields {
        let value = match field.field_type {
            FieldType::Number => json!(0),
            FieldType::Text => Value::String("—".to_string()),
        };
        state.set(field.key.clone(), value);
    }
    for list in &schema.lists {
        let value = match list.list_type {
            ListType::Map => json!({}),
            ListType::List => json!([]),
        };
        state.set(list.key.clone(), value);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schema_round_trips_through_json() {
        let schema = default_schema();
        assert_eq!(schema.fields.len(), 6);
        assert_eq!(schema.lists.len(), 3);
        assert_eq!(schema.direct_overwrite_keys.len(), 4);
    }

    #[test]
    fn blank_state_uses_field_type_defaults() {
        let schema = default_schema();
        let state = blank_character_state(&schema);
        assert_eq!(state.get("reward_points"), Some(&json!(0)));
        assert_eq!(state.get("name"), Some(&json!("—")));
        assert_eq!(state.get("inventory"), Some(&json!([])));
        assert_eq!(state.get("relationships"), Some(&json!({})));
    }
}
