//! Structured-extraction background worker (§4.13.2), grounded on the
//! original's `_extract_tags_async`: a second, separate LLM call asks for
//! whatever the regex tag parser's synchronous pass missed — lore, events,
//! NPCs, and (when the regex pass found no STATE tag of its own) a state
//! update — then dedups and saves whatever comes back.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use storyforge_core::{read_json_or_default, Workspace};
use storyforge_engine::state_updater;
use storyforge_index::{EventIndex, LoreIndex};
use storyforge_providers::{call_type, LlmProvider, UsageRecord, UsageSink};
use storyforge_types::{
    BranchId, CharacterSchema, CharacterState, Event, EventStatus, LoreEntry, Npc, StoryId,
};

use crate::config::StateReviewMode;
use crate::error::Result;
use crate::review::review_state_update;

/// Below this length the GM reply is assumed to carry nothing worth a
/// second LLM round-trip (mirrors the original's `len(gm_text) < 200`).
const MIN_TEXT_LEN: usize = 200;

#[derive(Debug, Default, Deserialize)]
struct ExtractionResult {
    #[serde(default)]
    lore: Vec<LoreEntry>,
    #[serde(default)]
    events: Vec<RawEvent>,
    #[serde(default)]
    npcs: Vec<Npc>,
    #[serde(default)]
    state: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event_type: String,
    title: String,
    description: String,
    #[serde(default = "default_status")]
    status: EventStatus,
    #[serde(default)]
    tags: String,
}

fn default_status() -> EventStatus {
    EventStatus::Planted
}

fn schema_summary(schema: &CharacterSchema) -> String {
    let mut lines = Vec::new();
    for f in &schema.fields {
        let type_name = match f.field_type {
            storyforge_types::FieldType::Text => "text",
            storyforge_types::FieldType::Number => "number",
        };
        lines.push(format!("- {}（{}）: {}", f.key, f.label, type_name));
    }
    for l in &schema.lists {
        match l.list_type {
            storyforge_types::ListType::Map => {
                lines.push(format!("- {}（{}）: map，用直接覆蓋", l.key, l.label));
            }
            storyforge_types::ListType::List => {
                let add = l.state_add_key.as_deref().unwrap_or("");
                let remove = l.state_remove_key.as_deref().unwrap_or("");
                lines.push(format!("- {}（{}）: list，新增用 {add}，移除用 {remove}", l.key, l.label));
            }
        }
    }
    lines.join("\n")
}

fn extraction_prompt(gm_text: &str, toc: &str, titles: &str, schema: &CharacterSchema, existing_keys: &str) -> String {
    format!(
        "你是一個 RPG 結構化資料擷取工具。分析以下 GM 回覆，提取結構化資訊。\n\n\
## GM 回覆\n{gm_text}\n\n\
## 1. 世界設定（lore）\n\
提取新的世界設定：體系規則、副本背景、場景描述等。不要提取劇情動態或角色行動。\n\
已有設定（避免重複）：\n{toc}\n\
格式：[{{\"category\": \"分類\", \"topic\": \"主題\", \"content\": \"完整描述\"}}]\n\
可用分類：主神設定與規則/體系/商城/副本世界觀/場景/NPC/故事追蹤\n\n\
## 2. 事件追蹤（events）\n\
提取重要事件：伏筆、轉折、戰鬥、發現等。不要記錄瑣碎事件。\n\
已有事件標題（避免重複）：{titles}\n\
格式：[{{\"event_type\": \"類型\", \"title\": \"標題\", \"description\": \"描述\", \"status\": \"planted\", \"tags\": \"關鍵字\"}}]\n\
可用類型：伏筆/轉折/遭遇/發現/戰鬥/獲得/觸發\n\
可用狀態：planted/triggered/resolved\n\n\
## 3. NPC 資料（npcs）\n\
提取首次登場或有重大變化的 NPC。\n\
格式：[{{\"name\": \"名字\", \"role\": \"定位\", \"appearance\": \"外觀\", \
\"personality\": {{\"openness\": N, \"conscientiousness\": N, \"extraversion\": N, \
\"agreeableness\": N, \"neuroticism\": N, \"summary\": \"一句話\"}}, \"backstory\": \"背景\"}}]\n\n\
## 4. 角色狀態變化（state）\n\
Schema 告訴你角色有哪些欄位：\n{schema}\n\
角色目前有這些欄位：{existing_keys}\n\n\
規則：\n\
- 列表型欄位用 `_add` / `_remove` 後綴（如 `inventory_add`, `inventory_remove`）\n\
- 數值型欄位用 `_delta` 後綴（如 `reward_points_delta: -500`）\n\
- 文字型欄位直接覆蓋（如 `gene_lock: \"第二階\"`），值要簡短（5-20字）\n\
- 可以新增永久性角色屬性（如學會新體系時加 `修真境界`, `法力` 等）\n\
- 禁止新增臨時性/場景性欄位（如 location, threat_level, combat_status, escape_options 等一次性描述）\n\
- 角色死亡時 `current_status` 設為 `\"end\"`\n\
格式：只填有變化的欄位。\n\n\
## 輸出\n\
JSON 物件，只包含有內容的類型：\n\
{{\"lore\": [...], \"events\": [...], \"npcs\": [...], \"state\": {{...}}}}\n\
沒有新資訊的類型省略或用空陣列/空物件。只輸出 JSON。",
        schema = schema_summary(schema),
    )
}

static JSON_OBJECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("JSON object regex is valid"));

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_result(raw: &str) -> Option<ExtractionResult> {
    let cleaned = strip_code_fence(raw);
    if let Ok(result) = serde_json::from_str(&cleaned) {
        return Some(result);
    }
    let m = JSON_OBJECT_RE.find(&cleaned)?;
    serde_json::from_str(m.as_str()).ok()
}

/// Counts of what actually got saved, for the caller's log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionCounts {
    pub lore: usize,
    pub events: usize,
    pub npcs: usize,
    pub state_applied: bool,
}

/// Runs one structured-extraction pass over `gm_text` and saves whatever
/// the LLM finds that isn't already known. `skip_state` should be `true`
/// when the synchronous regex tag parser already applied a STATE tag for
/// this turn, so the two paths never double-apply a delta (Open Question 3).
/// Returns `None` without calling the LLM at all for short replies.
#[allow(clippy::too_many_arguments)]
pub async fn run_extraction(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    message_index: i64,
    gm_text: &str,
    schema: &CharacterSchema,
    skip_state: bool,
    state_review_mode: StateReviewMode,
    lore_index: &LoreIndex,
    event_index: &EventIndex,
    provider: &dyn LlmProvider,
    usage: &dyn UsageSink,
) -> Result<Option<ExtractionCounts>> {
    if gm_text.chars().count() < MIN_TEXT_LEN {
        return Ok(None);
    }

    let toc = lore_index.table_of_contents()?;
    let mut existing_topics: std::collections::HashSet<String> =
        lore_index.all_entries()?.into_iter().map(|e| e.topic).collect();
    let mut existing_titles = event_index.titles_for_branch(branch)?;
    let titles_str = if existing_titles.is_empty() {
        "（無）".to_string()
    } else {
        let mut sorted: Vec<&String> = existing_titles.iter().collect();
        sorted.sort();
        sorted.into_iter().cloned().collect::<Vec<_>>().join(", ")
    };

    let current_state: CharacterState = read_json_or_default(&ws.branch(story, branch).character_state())?;
    let mut existing_keys: Vec<String> = current_state.0.keys().cloned().collect();
    existing_keys.sort();

    let prompt = extraction_prompt(gm_text, &toc, &titles_str, schema, &existing_keys.join(", "));

    let t0 = std::time::Instant::now();
    let response = provider.call_oneshot(&prompt, None).await;
    let elapsed_ms = t0.elapsed().as_millis() as i64;
    if response.trim().is_empty() {
        return Ok(None);
    }
    usage
        .log(
            story,
            UsageRecord {
                timestamp: chrono::Utc::now(),
                provider: provider.name().to_string(),
                model: String::new(),
                call_type: call_type::STRUCTURED_EXTRACTION.to_string(),
                prompt_tokens: None,
                output_tokens: None,
                total_tokens: None,
                branch_id: branch.clone(),
                elapsed_ms: Some(elapsed_ms),
            },
        )
        .await;

    let Some(data) = parse_result(&response) else {
        return Ok(None);
    };

    let mut counts = ExtractionCounts::default();

    for entry in data.lore {
        let topic = entry.topic.trim().to_string();
        if topic.is_empty() || existing_topics.contains(&topic) {
            continue;
        }
        lore_index.upsert(&entry)?;
        existing_topics.insert(topic);
        counts.lore += 1;
    }

    for raw in data.events {
        let title = raw.title.trim().to_string();
        if title.is_empty() || existing_titles.contains(&title) {
            continue;
        }
        event_index.insert(&Event {
            id: None,
            event_type: raw.event_type,
            title: title.clone(),
            description: raw.description,
            status: raw.status,
            tags: raw.tags,
            related_titles: String::new(),
            message_index: Some(message_index),
            branch_id: branch.clone(),
            created_at: chrono::Utc::now(),
        })?;
        existing_titles.insert(title);
        counts.events += 1;
    }

    for npc in data.npcs {
        if npc.name.trim().is_empty() {
            continue;
        }
        storyforge_engine::npc::upsert_npc(ws, story, branch, npc)?;
        counts.npcs += 1;
    }

    if !data.state.is_empty() && !skip_state {
        let outcome = review_state_update(&data.state, schema, state_review_mode, provider).await;
        state_updater::apply(ws, story, branch, &outcome.update, schema)?;
        counts.state_applied = true;
    }

    Ok(Some(counts))
}
