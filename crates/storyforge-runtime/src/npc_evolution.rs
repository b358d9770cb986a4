//! Background NPC-activity simulation (§4.13.3), grounded on the
//! original's `npc_evolution.py`: every few player turns, ask the LLM what
//! each known NPC is up to off-screen, and keep a rolling log of it to
//! inject into later system prompts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use storyforge_core::{read_json_or_default, write_json_atomic, Workspace};
use storyforge_providers::{call_type, LlmProvider, UsageRecord, UsageSink};
use storyforge_types::{BranchId, StoryId};

use crate::config::NpcEvolutionConfig;
use crate::error::Result;

const MAX_ACTIVITY_ENTRIES: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcActivity {
    pub npc_name: String,
    #[serde(default)]
    pub activity: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcActivityEntry {
    pub turn_index: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub activities: Vec<NpcActivity>,
}

fn load_activities(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<Vec<NpcActivityEntry>> {
    Ok(read_json_or_default(&ws.branch(story, branch).npc_activities())?)
}

fn save_activities(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    activities: &[NpcActivityEntry],
) -> Result<()> {
    write_json_atomic(&ws.branch(story, branch).npc_activities(), &activities.to_vec())?;
    Ok(())
}

/// Tracks the last evolution run per (story, branch) so the cooldown is
/// enforced in-process, mirroring the original's module-level `_last_run`
/// dict. Held by whatever owns the turn pipeline for the process lifetime.
#[derive(Default)]
pub struct EvolutionTracker {
    last_run: Mutex<HashMap<(StoryId, BranchId), Instant>>,
}

impl EvolutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `turn_index % interval_turns == 0 && turn_index >= interval_turns`,
    /// and at least `cooldown_seconds` since the last run on this branch.
    pub fn should_run(
        &self,
        story: &StoryId,
        branch: &BranchId,
        turn_index: u64,
        config: &NpcEvolutionConfig,
    ) -> bool {
        if turn_index < config.interval_turns || turn_index % config.interval_turns != 0 {
            return false;
        }
        let last_run = self.last_run.lock().unwrap();
        match last_run.get(&(story.clone(), branch.clone())) {
            Some(last) => last.elapsed() >= Duration::from_secs(config.cooldown_seconds),
            None => true,
        }
    }

    fn record_run(&self, story: &StoryId, branch: &BranchId) {
        self.last_run
            .lock()
            .unwrap()
            .insert((story.clone(), branch.clone()), Instant::now());
    }
}

static ACTIVITY_JSON_ARRAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[.*\]").expect("activity JSON array regex is valid"));

fn evolution_prompt(npc_profiles: &str, recent_context: &str) -> String {
    format!(
        "你是主神空間 RPG 的 NPC 行為模擬器。根據以下 NPC 資料和最近劇情，\
模擬每個 NPC 在當前時間段的自主活動。\n\n\
## NPC 資料\n{npc_profiles}\n\n\
## 最近劇情\n{recent_context}\n\n\
請為每個 NPC 生成一條簡短的自主活動描述，格式為 JSON 陣列：\n\
```json\n[\n  {{\"npc_name\": \"名字\", \"activity\": \"正在做什麼\", \
\"mood\": \"情緒\", \"location\": \"地點\"}}\n]\n```\n\
只輸出 JSON，不要其他文字。"
    )
}

/// Runs one evolution pass against the LLM and appends the result to the
/// branch's activity log, trimmed to the most recent 20 entries. Marks the
/// tracker's cooldown regardless of whether the call actually produced
/// usable output, matching the original (it stamps `_last_run` before
/// dispatching the background thread).
pub async fn run_evolution(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    turn_index: u64,
    npc_profiles: &str,
    recent_context: &str,
    tracker: &EvolutionTracker,
    provider: &dyn LlmProvider,
    usage: &dyn UsageSink,
) -> Result<bool> {
    tracker.record_run(story, branch);

    let prompt = evolution_prompt(npc_profiles, recent_context);
    let t0 = std::time::Instant::now();
    let response = provider.call_oneshot(&prompt, None).await;
    let elapsed_ms = t0.elapsed().as_millis() as i64;
    if response.trim().is_empty() {
        return Ok(false);
    }
    usage
        .log(
            story,
            UsageRecord {
                timestamp: chrono::Utc::now(),
                provider: provider.name().to_string(),
                model: String::new(),
                call_type: call_type::NPC_EVOLUTION.to_string(),
                prompt_tokens: None,
                output_tokens: None,
                total_tokens: None,
                branch_id: branch.clone(),
                elapsed_ms: Some(elapsed_ms),
            },
        )
        .await;

    let Some(m) = ACTIVITY_JSON_ARRAY_RE.find(&response) else {
        return Ok(false);
    };
    let Ok(activities) = serde_json::from_str::<Vec<NpcActivity>>(m.as_str()) else {
        return Ok(false);
    };
    if activities.is_empty() {
        return Ok(false);
    }

    let mut all = load_activities(ws, story, branch)?;
    all.push(NpcActivityEntry {
        turn_index,
        timestamp: chrono::Utc::now(),
        activities,
    });
    if all.len() > MAX_ACTIVITY_ENTRIES {
        let drop = all.len() - MAX_ACTIVITY_ENTRIES;
        all.drain(0..drop);
    }
    save_activities(ws, story, branch, &all)?;
    Ok(true)
}

/// Formats the last `limit` activity batches for system-prompt injection
/// (§4.8's "Recent NPC-activity summary"). Empty string if nothing logged
/// yet, so the caller can skip it without a blank retrieved block.
pub fn get_recent_activities(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    limit: usize,
) -> Result<String> {
    let all = load_activities(ws, story, branch)?;
    if all.is_empty() {
        return Ok(String::new());
    }
    let start = all.len().saturating_sub(limit);
    let mut lines = vec!["[NPC 近期動態]".to_string()];
    for entry in &all[start..] {
        for act in &entry.activities {
            let mut parts = vec![format!("{}：{}", act.npc_name, act.activity)];
            if !act.mood.is_empty() {
                parts.push(format!("情緒：{}", act.mood));
            }
            if !act.location.is_empty() {
                parts.push(format!("地點：{}", act.location));
            }
            lines.push(format!("- {}", parts.join("，")));
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use storyforge_providers::{GmReply, GmRequest, NullUsageSink, StreamEvent};
    use tempfile::tempdir;
    use tokio::sync::mpsc::UnboundedSender;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
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

    #[test]
    fn should_run_respects_interval_and_cooldown() {
        let tracker = EvolutionTracker::new();
        let config = NpcEvolutionConfig {
            interval_turns: 3,
            cooldown_seconds: 120,
        };
        let story = StoryId::new("s1");
        let branch = BranchId::root();

        assert!(!tracker.should_run(&story, &branch, 2, &config));
        assert!(!tracker.should_run(&story, &branch, 4, &config));
        assert!(tracker.should_run(&story, &branch, 3, &config));

        tracker.record_run(&story, &branch);
        assert!(!tracker.should_run(&story, &branch, 6, &config));
    }

    #[tokio::test]
    async fn run_evolution_parses_json_array_and_trims_to_twenty_entries() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let tracker = EvolutionTracker::new();
        let usage = NullUsageSink;
        let provider = StubProvider(
            r#"這是結果：```json
[{"npc_name": "艾莉絲", "activity": "在市集閒逛", "mood": "平靜", "location": "市集"}]
```"#
                .to_string(),
        );

        for turn in 1..=25u64 {
            let ran = run_evolution(&ws, &story, &branch, turn, "NPC profiles", "最近劇情", &tracker, &provider, &usage)
                .await
                .unwrap();
            assert!(ran);
        }

        let all = load_activities(&ws, &story, &branch).unwrap();
        assert_eq!(all.len(), MAX_ACTIVITY_ENTRIES);
        assert_eq!(all.last().unwrap().turn_index, 25);

        let text = get_recent_activities(&ws, &story, &branch, 2).unwrap();
        assert!(text.contains("[NPC 近期動態]"));
        assert!(text.contains("艾莉絲：在市集閒逛"));
    }

    #[tokio::test]
    async fn run_evolution_returns_false_on_empty_or_unparseable_reply() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let tracker = EvolutionTracker::new();
        let usage = NullUsageSink;
        let provider = StubProvider(String::new());

        let ran = run_evolution(&ws, &story, &branch, 3, "", "", &tracker, &provider, &usage)
            .await
            .unwrap();
        assert!(!ran);
    }

    #[test]
    fn get_recent_activities_is_empty_string_when_nothing_logged() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        assert_eq!(get_recent_activities(&ws, &story, &branch, 2).unwrap(), "");
    }
}
