//! Review gate for STATE updates (§4.9): a deterministic Stage A pass,
//! optionally followed by an LLM Stage B pass, sitting between a parsed
//! STATE tag and `storyforge_engine::state_updater`. Also hosts the
//! background key-normalization worker that re-applies unknown keys once
//! the LLM has remapped them to the schema's vocabulary, grounded on the
//! original's `_normalize_state_async`.

use serde_json::{Map, Value};
use storyforge_core::Workspace;
use storyforge_engine::state_updater;
use storyforge_providers::LlmProvider;
use storyforge_types::{CharacterSchema, FieldType};

use crate::config::StateReviewMode;
use crate::error::Result;

/// What Stage A found while trimming a raw STATE update down to something
/// safe to apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageANotes(pub Vec<String>);

/// A deterministic pass over a raw STATE update: drops keys that violate
/// the schema's declared types or the safety rule that list-typed keys may
/// only be touched through their `_add`/`_remove` companions, never by
/// direct overwrite. Never calls out to anything; always terminates.
pub fn stage_a_validate(raw: &Map<String, Value>, schema: &CharacterSchema) -> (Map<String, Value>, StageANotes) {
    let mut validated = Map::new();
    let mut notes = Vec::new();

    let number_fields: std::collections::HashSet<&str> = schema
        .fields
        .iter()
        .filter(|f| f.field_type == FieldType::Number)
        .map(|f| f.key.as_str())
        .collect();
    let bare_list_keys: std::collections::HashSet<&str> = schema
        .lists
        .iter()
        .filter(|l| l.list_type == storyforge_types::ListType::List)
        .map(|l| l.key.as_str())
        .collect();

    for (key, value) in raw {
        if bare_list_keys.contains(key.as_str()) {
            notes.push(format!(
                "dropped direct overwrite of list-typed key {key:?}; use its _add/_remove companions"
            ));
            continue;
        }
        if number_fields.contains(key.as_str()) && !value.is_number() {
            notes.push(format!("dropped {key:?}: schema declares it numeric, update sent {value}"));
            continue;
        }
        if (key == "reward_points" || key == "reward_points_delta") && !value.is_number() {
            notes.push(format!("dropped {key:?}: reward points must be numeric"));
            continue;
        }
        validated.insert(key.clone(), value.clone());
    }

    (validated, StageANotes(notes))
}

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn stage_b_prompt(update: &Map<String, Value>, known_keys: &[String]) -> String {
    format!(
        "你是一個 RPG 角色狀態更新審查工具。以下是一個待套用的角色狀態更新 JSON。\n\n\
標準欄位：{}\n\n\
請檢查這個更新是否合理（數值範圍正常、沒有不合理的欄位名稱、沒有明顯錯誤），\
如果需要修正請直接修改後輸出，否則原樣輸出。\n\n\
更新 JSON：\n{}\n\n\
只輸出修正後的 JSON 物件，不要任何解釋。",
        serde_json::to_string(known_keys).unwrap_or_default(),
        serde_json::to_string_pretty(update).unwrap_or_default(),
    )
}

/// Outcome of running a parsed STATE update through the review gate: the
/// update actually safe to apply, plus any notes accumulated along the way.
pub struct ReviewOutcome {
    pub update: Map<String, Value>,
    pub notes: Vec<String>,
    pub llm_patch_applied: bool,
}

/// Runs Stage A, then Stage B when `mode` allows it, and returns the update
/// the caller should hand to [`storyforge_engine::state_updater::apply_inner`].
/// `mode == Off` skips both stages and returns `raw` unchanged.
pub async fn review_state_update(
    raw: &Map<String, Value>,
    schema: &CharacterSchema,
    mode: StateReviewMode,
    provider: &dyn LlmProvider,
) -> ReviewOutcome {
    if mode == StateReviewMode::Off {
        return ReviewOutcome {
            update: raw.clone(),
            notes: Vec::new(),
            llm_patch_applied: false,
        };
    }

    let (validated, stage_a_notes) = stage_a_validate(raw, schema);
    let mut notes = stage_a_notes.0;

    if mode == StateReviewMode::DeterministicOnly {
        return ReviewOutcome {
            update: validated,
            notes,
            llm_patch_applied: false,
        };
    }

    let known_keys: Vec<String> = {
        let mut keys: Vec<String> = schema.known_keys().into_iter().collect();
        keys.sort();
        keys
    };
    let prompt = stage_b_prompt(&validated, &known_keys);
    let raw_reply = provider.call_oneshot(&prompt, None).await;
    if raw_reply.trim().is_empty() {
        notes.push("stage B review produced no reply, keeping stage A result".to_string());
        return ReviewOutcome {
            update: validated,
            notes,
            llm_patch_applied: false,
        };
    }

    let cleaned = strip_code_fence(&raw_reply);
    let patch: Option<Map<String, Value>> = serde_json::from_str::<Value>(&cleaned)
        .ok()
        .and_then(|v| v.as_object().cloned());

    let Some(patch) = patch else {
        notes.push("stage B reply was not a JSON object, keeping stage A result".to_string());
        return ReviewOutcome {
            update: validated,
            notes,
            llm_patch_applied: false,
        };
    };

    if mode == StateReviewMode::LlmShadow {
        notes.push(format!("stage B would patch to {patch:?} (shadow mode, not applied)"));
        return ReviewOutcome {
            update: validated,
            notes,
            llm_patch_applied: false,
        };
    }

    // LlmEnforce: re-validate the LLM's own patch through Stage A so it
    // can't smuggle in something Stage A would have rejected.
    let (patch_validated, patch_notes) = stage_a_validate(&patch, schema);
    notes.extend(patch_notes.0);
    let changed = patch_validated != validated;
    ReviewOutcome {
        update: patch_validated,
        notes,
        llm_patch_applied: changed,
    }
}

/// Background worker: asks the LLM to remap any keys `raw` had that aren't
/// in `schema`'s known vocabulary, then re-applies the remapped diff.
/// Mirrors `_normalize_state_async` — a no-op if nothing is unknown, and
/// silently drops the remap if the LLM's reply isn't usable (§4.9:
/// "idempotent... runs only when unknown keys are present").
pub async fn normalize_unknown_keys(
    ws: &Workspace,
    story: &storyforge_types::StoryId,
    branch: &storyforge_types::BranchId,
    raw: &Map<String, Value>,
    schema: &CharacterSchema,
    provider: &dyn LlmProvider,
) -> Result<Option<Map<String, Value>>> {
    let known = schema.known_keys();
    let unknown: Vec<&String> = raw.keys().filter(|k| !known.contains(k.as_str())).collect();
    if unknown.is_empty() {
        return Ok(None);
    }

    let mut sorted_known: Vec<&String> = known.iter().collect();
    sorted_known.sort();
    let prompt = format!(
        "你是一個 JSON 欄位正規化工具。以下是一個 RPG 角色狀態更新 JSON，\
但某些欄位名稱不符合標準。請將它們映射到正確的標準欄位名。\n\n\
標準欄位：{}\n\n\
映射規則：\n\
- 任何表示「獲得道具/裝備」的欄位 → inventory_add（陣列）\n\
- 任何表示「失去/消耗道具」的欄位 → inventory_remove（陣列）\n\
- 任何表示「獎勵點變化」的欄位 → reward_points_delta（整數）\n\
- 任何表示「完成任務」的欄位 → completed_missions_add（陣列）\n\
- 已經是標準欄位名的保持不變\n\
- 無法映射的自訂欄位（如 location, threat_level 等描述性狀態）保持原樣\n\n\
原始 JSON：\n{}\n\n\
請只輸出正規化後的 JSON，不要任何解釋。",
        serde_json::to_string(&sorted_known).unwrap_or_default(),
        serde_json::to_string_pretty(raw).unwrap_or_default(),
    );

    let reply = provider.call_oneshot(&prompt, None).await;
    if reply.trim().is_empty() {
        return Ok(None);
    }
    let cleaned = strip_code_fence(&reply);
    let normalized: Option<Map<String, Value>> = serde_json::from_str::<Value>(&cleaned)
        .ok()
        .and_then(|v| v.as_object().cloned());
    let Some(normalized) = normalized else {
        return Ok(None);
    };
    if &normalized == raw {
        return Ok(None);
    }

    state_updater::apply(ws, story, branch, &normalized, schema)?;
    Ok(Some(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use storyforge_providers::{GmReply, GmRequest, StreamEvent};
    use storyforge_types::{FieldDef, ListDef, ListType};
    use tokio::sync::mpsc::UnboundedSender;

    fn schema() -> CharacterSchema {
        CharacterSchema {
            fields: vec![FieldDef {
                key: "spirit".to_string(),
                label: "精神力".to_string(),
                field_type: FieldType::Number,
            }],
            lists: vec![ListDef {
                key: "inventory".to_string(),
                label: "物品".to_string(),
                list_type: ListType::List,
                state_add_key: Some("inventory_add".to_string()),
                state_remove_key: Some("inventory_remove".to_string()),
            }],
            direct_overwrite_keys: vec!["gene_lock".to_string()],
        }
    }

    #[test]
    fn stage_a_drops_non_numeric_value_for_number_field() {
        let raw = serde_json::from_value::<Map<String, Value>>(json!({"spirit": "很強"})).unwrap();
        let (validated, notes) = stage_a_validate(&raw, &schema());
        assert!(validated.is_empty());
        assert_eq!(notes.0.len(), 1);
    }

    #[test]
    fn stage_a_drops_bare_overwrite_of_list_typed_key() {
        let raw = serde_json::from_value::<Map<String, Value>>(json!({"inventory": ["劍"]})).unwrap();
        let (validated, notes) = stage_a_validate(&raw, &schema());
        assert!(validated.is_empty());
        assert_eq!(notes.0.len(), 1);
    }

    #[test]
    fn stage_a_passes_through_direct_overwrite_and_add_remove_keys() {
        let raw = serde_json::from_value::<Map<String, Value>>(json!({
            "gene_lock": "第二階",
            "inventory_add": ["鎮魂符"],
            "spirit": 12,
        }))
        .unwrap();
        let (validated, notes) = stage_a_validate(&raw, &schema());
        assert_eq!(validated.len(), 3);
        assert!(notes.0.is_empty());
    }

    struct StubProvider(String);

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn call_gm(&self, _request: GmRequest<'_>) -> GmReply {
            GmReply {
                text: String::new(),
                session_id: None,
            }
        }
        async fn call_gm_stream(&self, _request: GmRequest<'_>, _tx: UnboundedSender<StreamEvent>) {}
        async fn call_oneshot(&self, _prompt: &str, _system_prompt: Option<&str>) -> String {
            self.0.clone()
        }
        async fn generate_story_summary(&self, _conversation_text: &str) -> String {
            String::new()
        }
        async fn web_search(&self, _query: &str) -> String {
            String::new()
        }
    }

    #[tokio::test]
    async fn off_mode_skips_both_stages() {
        let raw = serde_json::from_value::<Map<String, Value>>(json!({"inventory": ["劍"]})).unwrap();
        let provider = StubProvider(String::new());
        let outcome = review_state_update(&raw, &schema(), StateReviewMode::Off, &provider).await;
        assert_eq!(outcome.update, raw);
    }

    #[tokio::test]
    async fn deterministic_only_mode_never_calls_the_provider() {
        let raw = serde_json::from_value::<Map<String, Value>>(json!({"gene_lock": "第二階"})).unwrap();
        let provider = StubProvider("should not be used".to_string());
        let outcome = review_state_update(&raw, &schema(), StateReviewMode::DeterministicOnly, &provider).await;
        assert_eq!(outcome.update.get("gene_lock"), Some(&json!("第二階")));
        assert!(!outcome.llm_patch_applied);
    }

    #[tokio::test]
    async fn llm_shadow_mode_logs_but_does_not_apply_the_patch() {
        let raw = serde_json::from_value::<Map<String, Value>>(json!({"gene_lock": "第二階"})).unwrap();
        let provider = StubProvider(r#"{"gene_lock": "第三階"}"#.to_string());
        let outcome = review_state_update(&raw, &schema(), StateReviewMode::LlmShadow, &provider).await;
        assert_eq!(outcome.update.get("gene_lock"), Some(&json!("第二階")));
        assert!(!outcome.llm_patch_applied);
        assert!(outcome.notes.iter().any(|n| n.contains("shadow mode")));
    }

    #[tokio::test]
    async fn llm_enforce_mode_applies_the_patch() {
        let raw = serde_json::from_value::<Map<String, Value>>(json!({"gene_lock": "第二階"})).unwrap();
        let provider = StubProvider(r#"{"gene_lock": "第三階"}"#.to_string());
        let outcome = review_state_update(&raw, &schema(), StateReviewMode::LlmEnforce, &provider).await;
        assert_eq!(outcome.update.get("gene_lock"), Some(&json!("第三階")));
        assert!(outcome.llm_patch_applied);
    }

    #[tokio::test]
    async fn normalize_unknown_keys_is_a_noop_when_nothing_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let story = storyforge_types::StoryId::new("s1");
        let branch = storyforge_types::BranchId::root();
        let raw = serde_json::from_value::<Map<String, Value>>(json!({"gene_lock": "第二階"})).unwrap();
        let provider = StubProvider("should not be used".to_string());
        let result = normalize_unknown_keys(&ws, &story, &branch, &raw, &schema(), &provider)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
