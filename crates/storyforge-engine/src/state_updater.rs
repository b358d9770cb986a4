//! Applies a STATE tag's update dict to a branch's character state file.
//!
//! Two passes happen on every STATE tag: this module's [`apply`] runs
//! immediately and synchronously against the schema's declared shape, and
//! `storyforge-runtime`'s background normalization worker later remaps any
//! keys this pass didn't recognize and replays them through [`apply_inner`].

use serde_json::{Map, Value};
use std::collections::HashSet;
use storyforge_core::{read_json_or_default, write_json_atomic, Result};
use storyforge_types::{CharacterSchema, CharacterState, ListType};

const REWARD_POINTS: &str = "reward_points";
const REWARD_POINTS_DELTA: &str = "reward_points_delta";

/// Splits an inventory-style list entry on the em-dash separator used to
/// append a note (`"鎮魂符×3 — 戰利品"`) and returns just the base name, the
/// same key the original matches a removal request against.
fn item_base_name(entry: &str) -> &str {
    entry.split(" — ").next().unwrap_or(entry).trim()
}

/// Applies `update` to `state` in place, following the schema's list/map/
/// direct-overwrite declarations. Keys the schema doesn't recognize are
/// still stored verbatim as long as they're scalar (string/number/bool) -
/// forward compatibility for fields the GM invents before the schema
/// catches up.
pub fn apply_inner(state: &mut CharacterState, update: &Map<String, Value>, schema: &CharacterSchema) {
    for list_def in &schema.lists {
        match list_def.list_type {
            ListType::Map => {
                if let Some(Value::Object(incoming)) = update.get(&list_def.key) {
                    let mut existing = state
                        .get(&list_def.key)
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                    state.set(list_def.key.clone(), Value::Object(existing));
                }
            }
            ListType::List => {
                if let Some(add_key) = &list_def.state_add_key {
                    if let Some(Value::Array(items)) = update.get(add_key) {
                        let mut list = state
                            .get(&list_def.key)
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        for item in items {
                            if !list.contains(item) {
                                list.push(item.clone());
                            }
                        }
                        state.set(list_def.key.clone(), Value::Array(list));
                    }
                }
                if let Some(remove_key) = &list_def.state_remove_key {
                    if let Some(Value::Array(items)) = update.get(remove_key) {
                        let remove_names: HashSet<&str> = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(item_base_name)
                            .collect();
                        let list = state
                            .get(&list_def.key)
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        let filtered: Vec<Value> = list
                            .into_iter()
                            .filter(|entry| {
                                entry
                                    .as_str()
                                    .map(|s| !remove_names.contains(item_base_name(s)))
                                    .unwrap_or(true)
                            })
                            .collect();
                        state.set(list_def.key.clone(), Value::Array(filtered));
                    }
                }
            }
        }
    }

    // A GM that sets reward_points directly (no delta) is accepted as-is.
    if update.contains_key(REWARD_POINTS) && !update.contains_key(REWARD_POINTS_DELTA) {
        if let Some(val) = update.get(REWARD_POINTS).and_then(number_as_i64) {
            state.set(REWARD_POINTS, Value::from(val));
        }
    }
    if let Some(delta) = update.get(REWARD_POINTS_DELTA).and_then(number_as_i64) {
        let current = state.reward_points();
        state.set(REWARD_POINTS, Value::from(current + delta));
    }

    for key in &schema.direct_overwrite_keys {
        if let Some(val) = update.get(key) {
            state.set(key.clone(), val.clone());
        }
    }

    let mut handled: HashSet<&str> = HashSet::new();
    handled.insert(REWARD_POINTS_DELTA);
    handled.insert(REWARD_POINTS);
    for list_def in &schema.lists {
        handled.insert(list_def.key.as_str());
        if let Some(k) = &list_def.state_add_key {
            handled.insert(k.as_str());
        }
        if let Some(k) = &list_def.state_remove_key {
            handled.insert(k.as_str());
        }
    }
    for key in &schema.direct_overwrite_keys {
        handled.insert(key.as_str());
    }
    for (key, val) in update {
        if !handled.contains(key.as_str()) && is_scalar(val) {
            state.set(key.clone(), val.clone());
        }
    }
}

fn number_as_i64(val: &Value) -> Option<i64> {
    if let Some(i) = val.as_i64() {
        Some(i)
    } else {
        val.as_f64().map(|f| f as i64)
    }
}

fn is_scalar(val: &Value) -> bool {
    matches!(val, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Loads the branch's character state, applies `update` against `schema`,
/// and writes it back atomically. Does not kick off background
/// normalization - that's the runtime's job once it has an LLM provider to
/// call.
pub fn apply(
    ws: &storyforge_core::Workspace,
    story: &storyforge_types::StoryId,
    branch: &storyforge_types::BranchId,
    update: &Map<String, Value>,
    schema: &CharacterSchema,
) -> Result<CharacterState> {
    let path = ws.branch(story, branch).character_state();
    let mut state: CharacterState = read_json_or_default(&path)?;
    apply_inner(&mut state, update, schema);
    write_json_atomic(&path, &state)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::default_schema;
    use serde_json::json;

    fn update(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn list_add_key_dedupes_and_appends() {
        let schema = default_schema();
        let mut state = CharacterState::new();
        state.set("inventory", json!(["鎮魂符×3"]));
        apply_inner(
            &mut state,
            &update(json!({"inventory_add": ["鎮魂符×3", "回復藥水"]})),
            &schema,
        );
        assert_eq!(state.get("inventory"), Some(&json!(["鎮魂符×3", "回復藥水"])));
    }

    #[test]
    fn list_remove_key_matches_on_base_name_before_dash_note() {
        let schema = default_schema();
        let mut state = CharacterState::new();
        state.set("inventory", json!(["鎮魂符×3 — 戰利品", "回復藥水"]));
        apply_inner(
            &mut state,
            &update(json!({"inventory_remove": ["鎮魂符×3"]})),
            &schema,
        );
        assert_eq!(state.get("inventory"), Some(&json!(["回復藥水"])));
    }

    #[test]
    fn map_list_merges_rather_than_replaces() {
        let schema = default_schema();
        let mut state = CharacterState::new();
        state.set("relationships", json!({"小薇": "信任"}));
        apply_inner(
            &mut state,
            &update(json!({"relationships": {"阿豪": "兄弟情"}})),
            &schema,
        );
        assert_eq!(
            state.get("relationships"),
            Some(&json!({"小薇": "信任", "阿豪": "兄弟情"}))
        );
    }

    #[test]
    fn reward_points_delta_accumulates_and_direct_set_is_accepted() {
        let schema = default_schema();
        let mut state = CharacterState::new();
        state.set("reward_points", json!(100));
        apply_inner(&mut state, &update(json!({"reward_points_delta": 50})), &schema);
        assert_eq!(state.reward_points(), 150);

        apply_inner(&mut state, &update(json!({"reward_points": 9000})), &schema);
        assert_eq!(state.reward_points(), 9000);
    }

    #[test]
    fn reward_points_direct_set_ignored_when_delta_also_present() {
        let schema = default_schema();
        let mut state = CharacterState::new();
        state.set("reward_points", json!(100));
        apply_inner(
            &mut state,
            &update(json!({"reward_points": 999, "reward_points_delta": 10})),
            &schema,
        );
        assert_eq!(state.reward_points(), 110);
    }

    #[test]
    fn direct_overwrite_keys_replace_wholesale() {
        let schema = default_schema();
        let mut state = CharacterState::new();
        state.set("physique", json!("普通人類"));
        apply_inner(&mut state, &update(json!({"physique": "強化人類"})), &schema);
        assert_eq!(state.get("physique"), Some(&json!("強化人類")));
    }

    #[test]
    fn unknown_scalar_keys_are_kept_but_unknown_objects_are_dropped() {
        let schema = default_schema();
        let mut state = CharacterState::new();
        apply_inner(
            &mut state,
            &update(json!({"mood": "振奮", "junk": {"a": 1}})),
            &schema,
        );
        assert_eq!(state.get("mood"), Some(&json!("振奮")));
        assert_eq!(state.get("junk"), None);
    }
}
