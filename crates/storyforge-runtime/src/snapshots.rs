//! Per-branch agent snapshot store (§4.12), grounded on the original's
//! `shared_world.py`: every phase transition appends a read-only snapshot of
//! one agent's state to `agent_snapshots.json`, keyed chronologically by
//! world day. Other agents (and the human player) read these to build
//! cross-agent awareness without touching each other's live branch data.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use storyforge_core::{read_json_or_default, write_json_atomic, LockRegistry, Workspace};
use storyforge_providers::{call_type, LlmProvider, UsageRecord, UsageSink};
use storyforge_types::{AgentSnapshot, BranchId, CharacterState, StoryId};

use crate::error::Result;

fn load(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<Vec<AgentSnapshot>> {
    Ok(read_json_or_default(&ws.branch(story, branch).agent_snapshots())?)
}

fn save(ws: &Workspace, story: &StoryId, branch: &BranchId, snapshots: &[AgentSnapshot]) -> Result<()> {
    write_json_atomic(&ws.branch(story, branch).agent_snapshots(), &snapshots.to_vec())?;
    Ok(())
}

/// The next sequential turn number for a branch's snapshot list — one past
/// however many snapshots have already been appended.
pub fn next_turn_number(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<u64> {
    Ok(load(ws, story, branch)?.len() as u64 + 1)
}

/// Appends one snapshot under the branch's lock, keeping the list in the
/// chronological append order the original relies on (it never sorts).
pub fn save_agent_snapshot(
    ws: &Workspace,
    locks: &LockRegistry,
    story: &StoryId,
    branch: &BranchId,
    world_day: f64,
    turn: u64,
    phase: &str,
    character_state: &CharacterState,
    completed_missions: Vec<String>,
    summary: String,
) -> Result<()> {
    let _guard = locks.branch_lock(story, branch).lock().expect("snapshot lock poisoned");
    let mut all = load(ws, story, branch)?;
    all.push(AgentSnapshot {
        world_day,
        turn,
        phase: phase.to_string(),
        character_state: character_state.clone(),
        completed_missions,
        summary: if summary.trim().is_empty() { None } else { Some(summary) },
        timestamp: chrono::Utc::now(),
    });
    save(ws, story, branch, &all)
}

/// Most recent snapshot at or before `world_day`, matching the original's
/// early-break reverse scan: snapshots are appended in chronological order,
/// so the last entry with `world_day <= target` is the answer.
pub fn get_agent_snapshot_at(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    world_day: f64,
) -> Result<Option<AgentSnapshot>> {
    let all = load(ws, story, branch)?;
    Ok(all.into_iter().rev().find(|s| s.world_day <= world_day))
}

/// Newest snapshot regardless of world day.
pub fn get_latest_snapshot(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<Option<AgentSnapshot>> {
    let all = load(ws, story, branch)?;
    Ok(all.into_iter().last())
}

/// One row of a multi-agent leaderboard (§4.12).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub branch_id: BranchId,
    pub name: String,
    pub reward_points: i64,
    pub completed_missions: usize,
    pub gene_lock: String,
    pub phase: String,
    pub current_status: String,
}

/// One agent known to a story, as supplied by whatever keeps the roster
/// (the original's `agent_manager.py`, out of this crate's scope — callers
/// pass the `(branch, display name)` pairs they already track).
#[derive(Debug, Clone)]
pub struct AgentRef {
    pub branch_id: BranchId,
    pub name: String,
}

fn display_name(cs: &CharacterState, fallback: &str) -> String {
    let name = cs.string_field("name");
    if name.is_empty() { fallback.to_string() } else { name.to_string() }
}

fn gene_lock(cs: &CharacterState) -> String {
    let v = cs.string_field("gene_lock");
    if v.is_empty() { "未開啟".to_string() } else { v.to_string() }
}

fn inventory_items(cs: &CharacterState) -> Vec<String> {
    match cs.get("inventory") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

fn entry_from_snapshot(agent: &AgentRef, snap: &AgentSnapshot) -> LeaderboardEntry {
    let cs = &snap.character_state;
    LeaderboardEntry {
        branch_id: agent.branch_id.clone(),
        name: display_name(cs, &agent.name),
        reward_points: cs.reward_points(),
        completed_missions: snap.completed_missions.len(),
        gene_lock: gene_lock(cs),
        phase: snap.phase.clone(),
        current_status: cs.string_field("current_status").to_string(),
    }
}

/// Ranks every agent with a snapshot by `reward_points` then
/// `completed_missions.len()`, descending. If `world_day` is `None`, uses
/// each agent's latest snapshot; otherwise the snapshot at that day.
pub fn get_leaderboard(
    ws: &Workspace,
    story: &StoryId,
    agents: &[AgentRef],
    world_day: Option<f64>,
) -> Result<Vec<LeaderboardEntry>> {
    let mut entries = Vec::new();
    for agent in agents {
        let snap = match world_day {
            Some(day) => get_agent_snapshot_at(ws, story, &agent.branch_id, day)?,
            None => get_latest_snapshot(ws, story, &agent.branch_id)?,
        };
        if let Some(snap) = snap {
            entries.push(entry_from_snapshot(agent, &snap));
        }
    }
    entries.sort_by(|a, b| {
        b.reward_points
            .cmp(&a.reward_points)
            .then(b.completed_missions.cmp(&a.completed_missions))
    });
    Ok(entries)
}

/// Builds the `[其他輪迴者動態]` block for `{other_agents}` injection: one
/// status line per agent at `current_day`, a top-5 leaderboard, and (if
/// `mentioned_text` names an agent by a ≥2-character match) that agent's
/// detailed profile. Empty string if the story has no other agents yet.
pub fn get_agents_context(
    ws: &Workspace,
    story: &StoryId,
    agents: &[AgentRef],
    current_day: f64,
    mentioned_text: &str,
) -> Result<String> {
    if agents.is_empty() {
        return Ok(String::new());
    }

    let mut snapshots: HashMap<BranchId, Option<AgentSnapshot>> = HashMap::new();
    for agent in agents {
        snapshots.insert(agent.branch_id.clone(), get_agent_snapshot_at(ws, story, &agent.branch_id, current_day)?);
    }

    let mut lines = vec!["[其他輪迴者動態]".to_string()];
    let mut ranked = Vec::new();
    for agent in agents {
        let snap = snapshots.get(&agent.branch_id).and_then(|s| s.as_ref());
        let Some(snap) = snap else {
            lines.push(format!("- {}：剛進入主神空間（新人）", agent.name));
            continue;
        };
        let cs = &snap.character_state;
        let name = display_name(cs, &agent.name);
        match snap.phase.as_str() {
            "hub" => lines.push(format!("- {}：在主神空間（已完成{}次副本）", name, snap.completed_missions.len())),
            "dungeon" => lines.push(format!("- {}：正在副本中", name)),
            _ => lines.push(format!("- {}：狀態未知", name)),
        }
        ranked.push((name, cs.reward_points()));
    }

    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    if !ranked.is_empty() {
        lines.push("排行榜（獎勵點）：".to_string());
        for (i, (name, points)) in ranked.iter().take(5).enumerate() {
            lines.push(format!("  {}. {} — {}點", i + 1, name, points));
        }
    }

    if let Some(agent) = find_mentioned_agent(mentioned_text, agents) {
        if let Some(Some(snap)) = snapshots.get(&agent.branch_id) {
            lines.push(String::new());
            lines.push(build_profile(agent, snap));
        }
    }

    Ok(if lines.len() > 1 { lines.join("\n") } else { String::new() })
}

fn find_mentioned_agent<'a>(text: &str, agents: &'a [AgentRef]) -> Option<&'a AgentRef> {
    if text.is_empty() {
        return None;
    }
    agents.iter().find(|a| a.name.chars().count() >= 2 && text.contains(&a.name))
}

fn build_profile(agent: &AgentRef, snap: &AgentSnapshot) -> String {
    let cs = &snap.character_state;
    let name = display_name(cs, &agent.name);
    let physique = cs.string_field("physique");
    let spirit = cs.string_field("spirit");
    let status = cs.string_field("current_status");
    let mut lines = vec![
        format!("[輪迴者「{name}」詳細資料 — 供你扮演此角色時參考]"),
        format!("體質：{}", if physique.is_empty() { "未知" } else { physique }),
        format!("精神力：{}", if spirit.is_empty() { "未知" } else { spirit }),
        format!("基因鎖：{}", gene_lock(cs)),
        format!("獎勵點：{}", cs.reward_points()),
        format!("當前狀態：{}", if status.is_empty() { "未知" } else { status }),
    ];
    let inventory = inventory_items(cs);
    if !inventory.is_empty() {
        lines.push(format!("裝備：{}", inventory.iter().take(5).cloned().collect::<Vec<_>>().join(", ")));
    }
    if !snap.completed_missions.is_empty() {
        lines.push(format!("已完成副本：{}", snap.completed_missions.join(", ")));
    }
    if let Some(summary) = &snap.summary {
        lines.push(format!("冒險經歷：{summary}"));
    }
    lines.join("\n")
}

static TRIM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^["'\s]*(.*?)["'\s]*$"#).expect("trim regex is valid"));

fn summary_prompt(snap: &AgentSnapshot) -> String {
    let cs = &snap.character_state;
    let name = cs.string_field("name");
    let status = cs.string_field("current_status");
    let missions = if snap.completed_missions.is_empty() {
        "無".to_string()
    } else {
        snap.completed_missions.join("、")
    };
    format!(
        "用一句話（30字以內）描述這位輪迴者的冒險經歷，作為旁白摘要，不要加引號。\n\
角色：{name}\n第{turn}輪，階段：{phase}\n已完成副本：{missions}\n獎勵點：{points}\n當前狀態：{status}",
        name = if name.is_empty() { "未知" } else { name },
        turn = snap.turn,
        phase = snap.phase,
        points = cs.reward_points(),
        status = if status.is_empty() { "未知" } else { status },
    )
}

/// Background worker (§4.13.4): fills in `summary` for every snapshot on a
/// branch that is still missing one, one LLM call each, and saves once at
/// the end if anything changed. A failed or empty call just leaves that
/// snapshot's summary unset — never fatal to the caller.
pub async fn generate_snapshot_summaries(
    ws: &Workspace,
    locks: &LockRegistry,
    story: &StoryId,
    branch: &BranchId,
    provider: &dyn LlmProvider,
    usage: &dyn UsageSink,
) -> Result<bool> {
    let _guard = locks.branch_lock(story, branch).lock().expect("snapshot lock poisoned");
    let mut all = load(ws, story, branch)?;
    let mut updated = false;

    for snap in all.iter_mut() {
        if snap.summary.is_some() {
            continue;
        }
        let prompt = summary_prompt(snap);
        let t0 = std::time::Instant::now();
        let response = provider.call_oneshot(&prompt, None).await;
        let elapsed_ms = t0.elapsed().as_millis() as i64;
        if response.trim().is_empty() {
            continue;
        }
        usage
            .log(
                story,
                UsageRecord {
                    timestamp: chrono::Utc::now(),
                    provider: provider.name().to_string(),
                    model: String::new(),
                    call_type: call_type::SNAPSHOT_SUMMARY.to_string(),
                    prompt_tokens: None,
                    output_tokens: None,
                    total_tokens: None,
                    branch_id: branch.clone(),
                    elapsed_ms: Some(elapsed_ms),
                },
            )
            .await;
        let cleaned = TRIM_RE.captures(response.trim()).map(|c| c[1].to_string()).unwrap_or_else(|| response.trim().to_string());
        snap.summary = Some(cleaned);
        updated = true;
    }

    if updated {
        save(ws, story, branch, &all)?;
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use storyforge_providers::{GmReply, GmRequest, NullUsageSink, StreamEvent};
    use tempfile::tempdir;
    use tokio::sync::mpsc::UnboundedSender;

    fn state(name: &str, points: i64) -> CharacterState {
        let mut cs = CharacterState::new();
        cs.set("name", Value::String(name.to_string()));
        cs.set("reward_points", Value::from(points));
        cs
    }

    struct StubProvider(String);

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn call_gm(&self, _request: GmRequest<'_>) -> GmReply {
            GmReply { text: String::new(), session_id: None }
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
    fn snapshot_at_returns_latest_at_or_before_target_day() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let locks = LockRegistry::new();
        let story = StoryId::new("s1");
        let branch = BranchId::root();

        save_agent_snapshot(&ws, &locks, &story, &branch, 1.0, 1, "hub", &state("小明", 10), vec![], String::new()).unwrap();
        save_agent_snapshot(&ws, &locks, &story, &branch, 3.0, 2, "dungeon", &state("小明", 50), vec!["副本一".into()], String::new()).unwrap();
        save_agent_snapshot(&ws, &locks, &story, &branch, 5.0, 3, "hub", &state("小明", 80), vec!["副本一".into(), "副本二".into()], String::new()).unwrap();

        let at_four = get_agent_snapshot_at(&ws, &story, &branch, 4.0).unwrap().unwrap();
        assert_eq!(at_four.turn, 2);
        assert_eq!(at_four.character_state.reward_points(), 50);

        let at_zero = get_agent_snapshot_at(&ws, &story, &branch, 0.5).unwrap();
        assert!(at_zero.is_none());

        let latest = get_latest_snapshot(&ws, &story, &branch).unwrap().unwrap();
        assert_eq!(latest.turn, 3);
    }

    #[test]
    fn leaderboard_ranks_by_points_then_missions_descending() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let locks = LockRegistry::new();
        let story = StoryId::new("s1");
        let b1 = BranchId::new("agent1");
        let b2 = BranchId::new("agent2");

        save_agent_snapshot(&ws, &locks, &story, &b1, 1.0, 1, "hub", &state("小明", 100), vec!["a".into()], String::new()).unwrap();
        save_agent_snapshot(&ws, &locks, &story, &b2, 1.0, 1, "hub", &state("小華", 100), vec!["a".into(), "b".into()], String::new()).unwrap();

        let agents = vec![
            AgentRef { branch_id: b1.clone(), name: "小明".to_string() },
            AgentRef { branch_id: b2.clone(), name: "小華".to_string() },
        ];
        let board = get_leaderboard(&ws, &story, &agents, None).unwrap();
        assert_eq!(board[0].name, "小華");
        assert_eq!(board[1].name, "小明");
    }

    #[test]
    fn agents_context_empty_when_no_agents() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let story = StoryId::new("s1");
        assert_eq!(get_agents_context(&ws, &story, &[], 1.0, "").unwrap(), "");
    }

    #[test]
    fn agents_context_includes_profile_when_mentioned() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let locks = LockRegistry::new();
        let story = StoryId::new("s1");
        let branch = BranchId::new("agent1");
        save_agent_snapshot(&ws, &locks, &story, &branch, 1.0, 1, "dungeon", &state("小明", 20), vec![], "曾與火龍一戰".to_string()).unwrap();

        let agents = vec![AgentRef { branch_id: branch.clone(), name: "小明".to_string() }];
        let text = get_agents_context(&ws, &story, &agents, 2.0, "你看過小明嗎？").unwrap();
        assert!(text.contains("[其他輪迴者動態]"));
        assert!(text.contains("正在副本中"));
        assert!(text.contains("輪迴者「小明」詳細資料"));
        assert!(text.contains("曾與火龍一戰"));
    }

    #[tokio::test]
    async fn generate_snapshot_summaries_fills_missing_and_skips_existing() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let locks = LockRegistry::new();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        save_agent_snapshot(&ws, &locks, &story, &branch, 1.0, 1, "hub", &state("小明", 10), vec![], String::new()).unwrap();
        save_agent_snapshot(&ws, &locks, &story, &branch, 2.0, 2, "hub", &state("小明", 20), vec![], "既有摘要".to_string()).unwrap();

        let provider = StubProvider("歷經磨難，終於成長。".to_string());
        let usage = NullUsageSink;
        let updated = generate_snapshot_summaries(&ws, &locks, &story, &branch, &provider, &usage).await.unwrap();
        assert!(updated);

        let all = load(&ws, &story, &branch).unwrap();
        assert_eq!(all[0].summary.as_deref(), Some("歷經磨難，終於成長。"));
        assert_eq!(all[1].summary.as_deref(), Some("既有摘要"));
    }

    #[tokio::test]
    async fn generate_snapshot_summaries_no_op_when_all_have_summaries() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let locks = LockRegistry::new();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        save_agent_snapshot(&ws, &locks, &story, &branch, 1.0, 1, "hub", &state("小明", 10), vec![], "已有".to_string()).unwrap();

        let provider = StubProvider(String::new());
        let usage = NullUsageSink;
        let updated = generate_snapshot_summaries(&ws, &locks, &story, &branch, &provider, &usage).await.unwrap();
        assert!(!updated);
    }
}
