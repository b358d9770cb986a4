//! The auto-play loop: a player-AI/GM pair taking turns on a dedicated
//! branch, with phase tracking, death detection and a crash-resumable
//! run state, same shape as the original script this binary replaces.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use storyforge_core::{read_json_opt, write_json_atomic};
use storyforge_sdk::{Client, TurnOutcome};
use storyforge_types::{BranchId, CharacterState, Npc, StoryId};

use crate::args::Args;

const STOP_FILE: &str = "auto_play.stop";
const MAX_RETRIES_PER_TURN: u32 = 3;
const DEATH_STATUS_KEYWORD: &str = "end";

static DUNGEON_START_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)【主神提示：.*?任務】|傳送開始|副本.*?開啟|進入副本|主神.*?傳送|白光.*?吞噬|場景.*?轉換").unwrap()
});
static DUNGEON_END_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)任務完成|返回主神空間|任務評級|副本.*?結束|回到.*?主神空間|傳送回.*?主神|主神.*?評分").unwrap()
});
static HUB_PATTERNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)兌換大廳|主神空間|訓練場|休息區|商城").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub turn: u32,
    pub phase: Phase,
    pub dungeon_count: u32,
    pub hub_turns: u32,
    pub death_detected: bool,
    pub consecutive_errors: u32,
    pub started_at: String,
    pub last_turn_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Hub,
    Dungeon,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            turn: 0,
            phase: Phase::Hub,
            dungeon_count: 0,
            hub_turns: 0,
            death_detected: false,
            consecutive_errors: 0,
            started_at: Utc::now().to_rfc3339(),
            last_turn_at: String::new(),
        }
    }
}

struct Analysis {
    death: bool,
    dungeon_start: bool,
    dungeon_end: bool,
    hub_detected: bool,
}

fn analyze_response(gm_response: &str, character_state: &CharacterState) -> Analysis {
    let status = character_state.string_field("current_status").trim().to_lowercase();
    Analysis {
        death: status == DEATH_STATUS_KEYWORD,
        dungeon_start: DUNGEON_START_PATTERNS.is_match(gm_response),
        dungeon_end: DUNGEON_END_PATTERNS.is_match(gm_response),
        hub_detected: HUB_PATTERNS.is_match(gm_response),
    }
}

fn update_phase(state: &mut RunState, analysis: &Analysis) {
    if analysis.death {
        state.death_detected = true;
        return;
    }
    match state.phase {
        Phase::Hub => {
            if analysis.dungeon_start {
                state.phase = Phase::Dungeon;
                state.dungeon_count += 1;
                state.hub_turns = 0;
                tracing::info!(dungeon = state.dungeon_count, "phase hub -> dungeon");
            } else {
                state.hub_turns += 1;
            }
        }
        Phase::Dungeon => {
            if analysis.dungeon_end || (analysis.hub_detected && !analysis.dungeon_start) {
                state.phase = Phase::Hub;
                state.hub_turns = 0;
                tracing::info!("phase dungeon -> hub");
            }
        }
    }
}

fn should_stop(state: &RunState, args: &Args) -> bool {
    if state.death_detected {
        tracing::info!("stop: character death detected");
        return true;
    }
    if state.turn >= args.max_turns {
        tracing::info!(max_turns = args.max_turns, "stop: max turns reached");
        return true;
    }
    if let Some(max_dungeons) = args.max_dungeons {
        if state.dungeon_count >= max_dungeons {
            tracing::info!(max_dungeons, "stop: max dungeons reached");
            return true;
        }
    }
    if std::path::Path::new(STOP_FILE).exists() {
        tracing::info!(file = STOP_FILE, "stop: stop file detected");
        return true;
    }
    if state.consecutive_errors >= args.max_errors {
        tracing::info!(errors = state.consecutive_errors, "stop: too many consecutive errors");
        return true;
    }
    false
}

/// A character card file, either the wrapped auto-play format or a bare
/// character state object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CharacterFile {
    Wrapped {
        character_state: CharacterState,
        #[serde(default)]
        personality: Option<String>,
        #[serde(default)]
        opening_message: Option<String>,
    },
    Bare(CharacterState),
}

struct LoadedCharacter {
    state: CharacterState,
    personality: Option<String>,
    opening_message: Option<String>,
}

fn load_character(path: &PathBuf) -> Result<LoadedCharacter> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading character file {}", path.display()))?;
    let file: CharacterFile = serde_json::from_str(&text).with_context(|| format!("parsing character file {}", path.display()))?;
    Ok(match file {
        CharacterFile::Wrapped { character_state, personality, opening_message } => {
            LoadedCharacter { state: character_state, personality, opening_message }
        }
        CharacterFile::Bare(state) => LoadedCharacter { state, personality: None, opening_message: None },
    })
}

fn default_personality() -> String {
    "保持角色一致性，做出符合角色性格的選擇。".to_string()
}

fn default_opening() -> String {
    "我剛到這裡，準備開始冒險。".to_string()
}

/// Creates the auto-play branch (blank or forked) and seeds its character
/// state/NPCs, returning the branch id.
fn setup(client: &Client, story: &StoryId, args: &Args, character: Option<&CharacterState>) -> Result<BranchId> {
    let name = format!("auto_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let parent = BranchId::new(args.parent_branch.clone());

    let branch = if args.no_blank {
        client.create_branch(story, &name, &parent, args.branch_point)?
    } else {
        client.create_blank_branch(story, &name)?
    };

    if let Some(state) = character {
        client.set_character_state(story, &branch.id, state)?;
    } else if args.no_blank {
        // Forked from parent: character state/NPCs already copied by
        // `create_branch` at the fork point - nothing further to seed.
    } else {
        let schema = client.story_schema(story)?;
        let blank = storyforge_engine::schema::blank_character_state(&schema);
        client.set_character_state(story, &branch.id, &blank)?;
        client.set_npcs(story, &branch.id, &[] as &[Npc])?;
    }

    Ok(branch.id)
}

fn state_path(client: &Client, story: &StoryId, branch: &BranchId) -> PathBuf {
    client.workspace().branch(story, branch).auto_play_state()
}

fn transcript_path(client: &Client, story: &StoryId, branch: &BranchId) -> PathBuf {
    client.workspace().branch(story, branch).auto_play_transcript()
}

fn save_run_state(client: &Client, story: &StoryId, branch: &BranchId, state: &RunState) -> Result<()> {
    write_json_atomic(&state_path(client, story, branch), state)?;
    Ok(())
}

fn load_run_state(client: &Client, story: &StoryId, branch: &BranchId) -> Result<Option<RunState>> {
    Ok(read_json_opt(&state_path(client, story, branch))?)
}

fn append_transcript(client: &Client, story: &StoryId, branch: &BranchId, entry: &str) -> Result<()> {
    use std::io::Write;
    let path = transcript_path(client, story, branch);
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(entry.as_bytes())?;
    Ok(())
}

fn log_turn(
    client: &Client,
    story: &StoryId,
    branch: &BranchId,
    state: &RunState,
    player_text: &str,
    gm_response: &str,
    image_prompt: Option<&str>,
) -> Result<()> {
    let preview = |s: &str| s.chars().take(80).collect::<String>();
    tracing::info!(
        turn = state.turn,
        phase = ?state.phase,
        dungeon = state.dungeon_count,
        player = %preview(player_text),
        gm = %preview(gm_response),
        "turn complete"
    );
    let image_line = image_prompt.map(|p| format!("\n**Image:** {p}\n")).unwrap_or_default();
    let entry = format!(
        "\n## Turn {} [{:?}]\n\n**Player:**\n{}\n\n**GM:**\n{}\n{}\n---\n",
        state.turn, state.phase, player_text, gm_response, image_line
    );
    append_transcript(client, story, branch, &entry)
}

fn print_summary(state: &RunState, story: &StoryId, branch: &BranchId, client: &Client) {
    println!(
        "\n{sep}\n  AUTO-PLAY COMPLETE\n{sep}\n  Turns played:  {}\n  Dungeons:      {}\n  Final phase:   {:?}\n  Death:         {}\n  Started:       {}\n  Ended:         {}\n  Branch:        {}\n  Transcript:    {}\n{sep}\n",
        state.turn,
        state.dungeon_count,
        state.phase,
        if state.death_detected { "Yes" } else { "No" },
        state.started_at,
        state.last_turn_at,
        branch.as_str(),
        transcript_path(client, story, branch).display(),
        sep = "#".repeat(60),
    );
}

pub async fn run(args: Args, client: Client) -> Result<()> {
    let story = StoryId::new(args.story_id.clone());
    client.init()?;

    let character = match &args.character {
        Some(path) => Some(load_character(path)?),
        None => None,
    };
    let personality = args
        .personality
        .clone()
        .or_else(|| character.as_ref().and_then(|c| c.personality.clone()))
        .unwrap_or_else(default_personality);
    let opening = args
        .opening
        .clone()
        .or_else(|| character.as_ref().and_then(|c| c.opening_message.clone()))
        .unwrap_or_else(default_opening);

    let (branch, mut state) = if args.resume {
        let branch_id = BranchId::new(args.branch_id.clone().expect("validated by Args::validate"));
        let mut loaded = load_run_state(&client, &story, &branch_id)?
            .with_context(|| format!("no saved auto-play state found for branch {}", branch_id.as_str()))?;
        loaded.death_detected = false;
        tracing::info!(turn = loaded.turn, branch = %branch_id.as_str(), "resuming auto-play run");
        (branch_id, loaded)
    } else {
        let branch_id = setup(&client, &story, &args, character.as_ref().map(|c| &c.state))?;
        let state = RunState::default();
        let header = format!(
            "# Auto-Play Transcript\n\n- Story: {}\n- Branch: {}\n- Started: {}\n\n---\n",
            story.as_str(),
            branch_id.as_str(),
            state.started_at,
        );
        std::fs::write(transcript_path(&client, &story, &branch_id), header)?;
        (branch_id, state)
    };

    tracing::info!(story = %story.as_str(), branch = %branch.as_str(), "auto-play started");
    if let Some(provider) = &args.provider {
        tracing::warn!(provider, "--provider ignored: no concrete LLM adapter ships with this workspace");
    }
    if std::path::Path::new(STOP_FILE).exists() {
        std::fs::remove_file(STOP_FILE).ok();
    }

    while !should_stop(&state, &args) {
        let mut player_text = if state.turn == 0 && !args.resume {
            opening.clone()
        } else {
            generate_player_action(&client, &story, &branch, &personality, &state, &args).await?
        };

        if !args.no_web_search {
            if let Some(context) = web_search_enrichment(&client, &story, &branch, &player_text, state.turn).await {
                player_text = format!("{context}\n{player_text}");
            }
        }

        let mut gm_text: Option<String> = None;
        let mut image_prompt: Option<String> = None;
        for attempt in 1..=MAX_RETRIES_PER_TURN {
            match client.send_message(&story, &branch, &player_text, "").await {
                Ok(TurnOutcome::Turn(turn)) => {
                    image_prompt = turn.tags.image_prompt.clone();
                    gm_text = Some(turn.gm_text);
                    break;
                }
                Ok(TurnOutcome::Cheat(_)) => {
                    // A `/gm` command was sent instead of narrative text; not
                    // expected from the player AI, but harmless - skip ahead.
                    gm_text = Some(String::new());
                    break;
                }
                Err(err) => {
                    tracing::warn!(turn = state.turn, attempt, error = %err, "turn attempt failed");
                    if attempt < MAX_RETRIES_PER_TURN {
                        let backoff = args.turn_delay * 2f64.powi((attempt - 1) as i32);
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }

        let Some(gm_text) = gm_text else {
            state.consecutive_errors += 1;
            state.last_turn_at = Utc::now().to_rfc3339();
            save_run_state(&client, &story, &branch, &state)?;
            if state.consecutive_errors >= args.max_errors {
                break;
            }
            let backoff = args.turn_delay * 2f64.powi(state.consecutive_errors.min(6) as i32);
            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            continue;
        };

        state.consecutive_errors = 0;

        let character_state = client.character_state(&story, &branch)?;
        let analysis = analyze_response(&gm_text, &character_state);
        update_phase(&mut state, &analysis);
        let shown_image = if args.with_images { image_prompt.as_deref() } else { None };
        log_turn(&client, &story, &branch, &state, &player_text, &gm_text, shown_image)?;

        state.last_turn_at = Utc::now().to_rfc3339();
        save_run_state(&client, &story, &branch, &state)?;
        state.turn += 1;

        tokio::time::sleep(Duration::from_secs_f64(args.turn_delay)).await;
    }

    print_summary(&state, &story, &branch, &client);
    Ok(())
}

/// A player is nudged toward requesting the next dungeon once they've spent
/// too long in the hub, mirroring the original script's phase-specific
/// prompt hint.
fn phase_hint(state: &RunState, args: &Args) -> &'static str {
    match state.phase {
        Phase::Dungeon => "你正在副本任務中。優先存活和完成任務目標，保持警惕。",
        Phase::Hub if state.hub_turns >= args.max_hub_turns => {
            "你已經在主神空間待了很久。是時候請求下一個副本任務了。"
        }
        Phase::Hub => "你在主神空間。可以兌換裝備、訓練、與NPC互動、收集情報。",
    }
}

/// Calls the player-AI side of the pair: a one-shot prompt built from the
/// recent timeline, the configured personality and a phase hint, through
/// the same provider the GM uses.
async fn generate_player_action(
    client: &Client,
    story: &StoryId,
    branch: &BranchId,
    personality: &str,
    state: &RunState,
    args: &Args,
) -> Result<String> {
    let page = client.messages(story, branch, storyforge_sdk::MessagesQuery { tail: Some(6), ..Default::default() })?;
    let recent = page
        .messages
        .iter()
        .map(|m| format!("{}: {}", if m.role == storyforge_types::Role::User { "玩家" } else { "GM" }, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let hint = phase_hint(state, args);
    let prompt = format!(
        "你正在扮演一名玩家角色，性格設定如下：\n{personality}\n\n最近的對話：\n{recent}\n\n階段提示：{hint}\n\n請用第一人稱簡短描述你接下來的行動（1-3句話）。"
    );
    let action = client.provider().call_oneshot(&prompt, None).await;
    if action.trim().is_empty() {
        bail!("player AI returned an empty action");
    }
    Ok(action)
}

const WEB_SEARCH_INTERVAL: u32 = 5;

/// Every `WEB_SEARCH_INTERVAL` turns, asks the provider's web-search hook
/// for lore/dungeon background to fold into the next player message before
/// it reaches the GM. Returns `None` off-cadence or on an empty result.
async fn web_search_enrichment(client: &Client, story: &StoryId, branch: &BranchId, player_text: &str, turn: u32) -> Option<String> {
    if turn % WEB_SEARCH_INTERVAL != 0 {
        return None;
    }
    let page = client.messages(story, branch, storyforge_sdk::MessagesQuery { tail: Some(1), ..Default::default() }).ok()?;
    let gm_last = page.messages.last().map(|m| m.content.as_str()).unwrap_or("");
    let query = format!(
        "根據以下 RPG 遊戲片段，搜尋「無限恐怖」或「諸天無限流」相關的設定資料（體系、副本世界觀、能力系統、戰鬥機制等），用繁體中文提供 3-5 條最相關的資訊。\n\n遊戲片段：\n{}\n{}",
        gm_last.chars().take(300).collect::<String>(),
        player_text.chars().take(200).collect::<String>(),
    );
    let result = client.provider().web_search(&query).await;
    if result.trim().is_empty() {
        return None;
    }
    Some(format!("[網路搜尋參考資料]\n{result}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn character_with_status(status: &str) -> CharacterState {
        let mut state = CharacterState::new();
        state.set("current_status", serde_json::json!(status));
        state
    }

    #[test]
    fn analyze_response_detects_death_from_status() {
        let state = character_with_status("end");
        let analysis = analyze_response("everything is quiet", &state);
        assert!(analysis.death);
    }

    #[test]
    fn analyze_response_is_case_insensitive_on_status() {
        let state = character_with_status("End");
        let analysis = analyze_response("everything is quiet", &state);
        assert!(analysis.death);
    }

    #[test]
    fn analyze_response_detects_dungeon_start() {
        let state = character_with_status("健康");
        let analysis = analyze_response("白光瞬間吞噬了你的視野", &state);
        assert!(analysis.dungeon_start);
        assert!(!analysis.dungeon_end);
    }

    #[test]
    fn analyze_response_detects_dungeon_end() {
        let state = character_with_status("健康");
        let analysis = analyze_response("任務完成，你被傳送回主神空間", &state);
        assert!(analysis.dungeon_end);
    }

    #[test]
    fn analyze_response_detects_hub() {
        let state = character_with_status("健康");
        let analysis = analyze_response("你回到了兌換大廳", &state);
        assert!(analysis.hub_detected);
        assert!(!analysis.dungeon_start);
    }

    #[test]
    fn update_phase_transitions_hub_to_dungeon() {
        let mut state = RunState::default();
        let analysis = Analysis { death: false, dungeon_start: true, dungeon_end: false, hub_detected: false };
        update_phase(&mut state, &analysis);
        assert_eq!(state.phase, Phase::Dungeon);
        assert_eq!(state.dungeon_count, 1);
    }

    #[test]
    fn update_phase_transitions_dungeon_to_hub_on_end() {
        let mut state = RunState { phase: Phase::Dungeon, ..RunState::default() };
        let analysis = Analysis { death: false, dungeon_start: false, dungeon_end: true, hub_detected: false };
        update_phase(&mut state, &analysis);
        assert_eq!(state.phase, Phase::Hub);
    }

    #[test]
    fn update_phase_ignores_hub_keywords_mid_dungeon_start() {
        let mut state = RunState { phase: Phase::Dungeon, ..RunState::default() };
        let analysis = Analysis { death: false, dungeon_start: true, dungeon_end: false, hub_detected: true };
        update_phase(&mut state, &analysis);
        assert_eq!(state.phase, Phase::Dungeon);
    }

    #[test]
    fn update_phase_sticky_on_death() {
        let mut state = RunState::default();
        let analysis = Analysis { death: true, dungeon_start: true, dungeon_end: false, hub_detected: false };
        update_phase(&mut state, &analysis);
        assert!(state.death_detected);
        assert_eq!(state.phase, Phase::Hub);
    }

    #[test]
    fn should_stop_on_death() {
        let args = Args::parse_from(["storyforge"]);
        let mut state = RunState::default();
        state.death_detected = true;
        assert!(should_stop(&state, &args));
    }

    #[test]
    fn should_stop_on_max_turns() {
        let args = Args::parse_from(["storyforge", "--max-turns", "5"]);
        let state = RunState { turn: 5, ..RunState::default() };
        assert!(should_stop(&state, &args));
    }

    #[test]
    fn should_not_stop_mid_run() {
        let args = Args::parse_from(["storyforge", "--max-turns", "5"]);
        let state = RunState { turn: 2, ..RunState::default() };
        assert!(!should_stop(&state, &args));
    }

    #[test]
    fn load_character_accepts_bare_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.json");
        std::fs::write(&path, r#"{"name": "艾拉", "current_status": "健康"}"#).unwrap();
        let loaded = load_character(&path).unwrap();
        assert_eq!(loaded.state.string_field("name"), "艾拉");
        assert!(loaded.personality.is_none());
    }

    #[test]
    fn load_character_accepts_wrapped_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapped.json");
        std::fs::write(
            &path,
            r#"{"character_state": {"name": "艾拉"}, "personality": "謹慎", "opening_message": "你好"}"#,
        )
        .unwrap();
        let loaded = load_character(&path).unwrap();
        assert_eq!(loaded.state.string_field("name"), "艾拉");
        assert_eq!(loaded.personality.as_deref(), Some("謹慎"));
        assert_eq!(loaded.opening_message.as_deref(), Some("你好"));
    }
}
