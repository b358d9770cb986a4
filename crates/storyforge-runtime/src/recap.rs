//! Rolling narrative compaction (§4.6), grounded on the original's
//! `compaction.py`. Keeps the system prompt's "what happened so far" short
//! by asking the LLM to fold everything before the recent window into a
//! short third-person recap, replacing the need to ship the whole
//! transcript on every turn.

use storyforge_core::{read_json_or_default, write_json_atomic, LockRegistry, Workspace};
use storyforge_providers::{call_type, LlmProvider, UsageRecord, UsageSink};
use storyforge_types::{CharacterState, Message, Recap, Role, StoryId};

use crate::config::RecapConfig;
use crate::error::Result;

const DIVERGENCE_NOTE: &str = "（注意：以下為分支劇情，從此處開始與主線不同。）";

fn recap_path(ws: &Workspace, story: &StoryId, branch: &storyforge_types::BranchId) -> std::path::PathBuf {
    ws.branch(story, branch).conversation_recap()
}

pub fn load_recap(
    ws: &Workspace,
    story: &StoryId,
    branch: &storyforge_types::BranchId,
) -> Result<Recap> {
    Ok(read_json_or_default(&recap_path(ws, story, branch))?)
}

pub fn save_recap(
    ws: &Workspace,
    story: &StoryId,
    branch: &storyforge_types::BranchId,
    recap: &Recap,
) -> Result<()> {
    write_json_atomic(&recap_path(ws, story, branch), recap)?;
    Ok(())
}

/// `timeline_len - RECENT_WINDOW - (compacted_through+1) > MIN_UNCOMPACTED`
/// (§4.6).
pub fn should_compact(recap: &Recap, timeline_len: i64, config: &RecapConfig) -> bool {
    timeline_len - config.recent_window - (recap.compacted_through_index + 1)
        > config.min_uncompacted_for_trigger
}

/// The tail of the timeline the turn pipeline sends to the LLM verbatim,
/// bypassing the recap entirely (§4.6).
pub fn context_window<'a>(timeline: &'a [Message], config: &RecapConfig) -> &'a [Message] {
    let window = config.recent_window.max(0) as usize;
    let start = timeline.len().saturating_sub(window);
    &timeline[start..]
}

/// Copies a parent's recap onto a freshly forked child, appending a
/// divergence note if the fork point falls inside the parent's already-
/// compacted region (so the reader knows the recap covers story the child
/// no longer shares).
pub fn copy_recap_to_branch(
    ws: &Workspace,
    story: &StoryId,
    parent: &storyforge_types::BranchId,
    child: &storyforge_types::BranchId,
    branch_point_index: i64,
) -> Result<()> {
    let mut recap = load_recap(ws, story, parent)?;
    if branch_point_index >= 0 && recap.compacted_through_index > branch_point_index {
        if !recap.recap_text.trim().is_empty() {
            recap.recap_text = format!("{}\n{}", recap.recap_text.trim(), DIVERGENCE_NOTE);
        } else {
            recap.recap_text = DIVERGENCE_NOTE.to_string();
        }
    }
    save_recap(ws, story, child, &recap)
}

fn character_name(state: &CharacterState) -> String {
    let name = state.string_field("name");
    if name.is_empty() {
        "主角".to_string()
    } else {
        name.to_string()
    }
}

fn format_messages(messages: &[Message]) -> String {
    const PER_MESSAGE_CAP: usize = 1000;
    messages
        .iter()
        .map(|m| {
            let prefix = match m.role {
                Role::User => "【玩家】",
                Role::Gm => "【GM】",
            };
            let content: String = m.content.chars().take(PER_MESSAGE_CAP).collect();
            let truncated = if m.content.chars().count() > PER_MESSAGE_CAP {
                format!("{content}…（略）")
            } else {
                content
            };
            format!("{prefix}{truncated}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn compact_prompt(existing_recap: &str, character_name: &str, segment_text: &str) -> String {
    let continuation = if existing_recap.trim().is_empty() {
        String::new()
    } else {
        format!("已有的前情摘要：\n{}\n\n請延續這段摘要，", existing_recap.trim())
    };
    format!(
        "你是 RPG 劇情摘要工具。{continuation}用第三人稱、繁體中文，\
         以主角「{character_name}」的視角，將以下對話記錄濃縮成一段 500-800 字的連貫敘事摘要。\n\
         不要記錄數值、道具清單、NPC 詳細資料或世界設定 — 這些由其他系統追蹤，只保留劇情脈絡。\n\n\
         ## 對話記錄\n{segment_text}\n\n請只輸出摘要文字，不要加任何標記或解釋。"
    )
}

fn meta_compact_prompt(recap_text: &str, target: usize) -> String {
    format!(
        "以下摘要過長，請濃縮到約 {target} 字，保留最重要的劇情脈絡，用繁體中文第三人稱：\n\n{recap_text}\n\n只輸出濃縮後的文字。"
    )
}

/// Runs compaction synchronously against `timeline` if it's currently due,
/// under the branch's try-lock (skip, don't block, if the branch is
/// already busy compacting or committing a turn). Returns `true` if
/// compaction ran.
pub async fn compact_if_due(
    ws: &Workspace,
    story: &StoryId,
    branch: &storyforge_types::BranchId,
    timeline: &[Message],
    state: &CharacterState,
    locks: &LockRegistry,
    provider: &dyn LlmProvider,
    usage: &dyn UsageSink,
    config: &RecapConfig,
) -> Result<bool> {
    let recap = load_recap(ws, story, branch)?;
    if !should_compact(&recap, timeline.len() as i64, config) {
        return Ok(false);
    }
    let lock = locks.branch_lock(story, branch);
    let Ok(_guard) = lock.try_lock() else {
        return Ok(false);
    };

    // Re-check under the lock: another commit may have advanced the recap
    // or the timeline since we last read it.
    let recap = load_recap(ws, story, branch)?;
    if !should_compact(&recap, timeline.len() as i64, config) {
        return Ok(false);
    }

    let window = config.recent_window.max(0) as usize;
    let start = (recap.compacted_through_index + 1).max(0) as usize;
    let end = timeline.len().saturating_sub(window);
    if start >= end {
        return Ok(false);
    }
    let segment = &timeline[start..end];
    let segment_text = format_messages(segment);
    let name = character_name(state);
    let prompt = compact_prompt(recap.display_text(), &name, &segment_text);

    let t0 = std::time::Instant::now();
    let mut result = provider.call_oneshot(&prompt, None).await;
    let elapsed_ms = t0.elapsed().as_millis() as i64;
    if result.trim().is_empty() {
        return Ok(false);
    }
    usage
        .log(
            story,
            UsageRecord {
                timestamp: chrono::Utc::now(),
                provider: provider.name().to_string(),
                model: String::new(),
                call_type: call_type::COMPACTION.to_string(),
                prompt_tokens: None,
                output_tokens: None,
                total_tokens: None,
                branch_id: branch.clone(),
                elapsed_ms: Some(elapsed_ms),
            },
        )
        .await;

    if result.chars().count() > config.recap_char_cap {
        let t0 = std::time::Instant::now();
        let meta = provider
            .call_oneshot(&meta_compact_prompt(&result, config.recap_meta_compact_target), None)
            .await;
        let elapsed_ms = t0.elapsed().as_millis() as i64;
        if !meta.trim().is_empty() {
            result = meta;
            usage
                .log(
                    story,
                    UsageRecord {
                        timestamp: chrono::Utc::now(),
                        provider: provider.name().to_string(),
                        model: String::new(),
                        call_type: call_type::COMPACTION.to_string(),
                        prompt_tokens: None,
                        output_tokens: None,
                        total_tokens: None,
                        branch_id: branch.clone(),
                        elapsed_ms: Some(elapsed_ms),
                    },
                )
                .await;
        }
    }

    let turns_compacted = segment.iter().filter(|m| m.role == Role::User).count() as u64;
    let new_recap = Recap {
        compacted_through_index: end as i64 - 1,
        last_compacted_at: Some(chrono::Utc::now()),
        recap_text: result.trim().to_string(),
        total_turns_compacted: recap.total_turns_compacted + turns_compacted,
    };
    save_recap(ws, story, branch, &new_recap)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use storyforge_providers::{GmReply, GmRequest, NullUsageSink, StreamEvent};
    use storyforge_types::BranchId;
    use tempfile::tempdir;
    use tokio::sync::mpsc::UnboundedSender;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    struct StubProvider {
        reply: StdMutex<String>,
    }

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
            self.reply.lock().unwrap().clone()
        }
        async fn generate_story_summary(&self, _conversation_text: &str) -> String {
            String::new()
        }
        async fn web_search(&self, _query: &str) -> String {
            String::new()
        }
    }

    fn timeline_of(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(i as i64, format!("玩家說第{i}句"))
                } else {
                    Message::gm(i as i64, format!("GM回覆第{i}句"))
                }
            })
            .collect()
    }

    #[test]
    fn should_compact_matches_threshold_formula() {
        let config = RecapConfig::default();
        let recap = Recap::default();
        assert!(should_compact(&recap, 60, &config));
        assert!(!should_compact(&recap, 40, &config));
    }

    #[test]
    fn context_window_is_the_last_n_messages() {
        let config = RecapConfig::default();
        let timeline = timeline_of(25);
        let window = context_window(&timeline, &config);
        assert_eq!(window.len(), 20);
        assert_eq!(window[0].index, 5);
    }

    #[test]
    fn divergence_note_appended_only_when_fork_is_inside_compacted_region() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let parent = BranchId::root();
        let child = BranchId::new("fork1");

        let mut recap = Recap::default();
        recap.compacted_through_index = 39;
        recap.recap_text = "主角穿越到了異世界。".to_string();
        save_recap(&ws, &story, &parent, &recap).unwrap();

        copy_recap_to_branch(&ws, &story, &parent, &child, 10).unwrap();
        let child_recap = load_recap(&ws, &story, &child).unwrap();
        assert!(child_recap.recap_text.contains("分支劇情"));

        let child2 = BranchId::new("fork2");
        copy_recap_to_branch(&ws, &story, &parent, &child2, 50).unwrap();
        let child2_recap = load_recap(&ws, &story, &child2).unwrap();
        assert!(!child2_recap.recap_text.contains("分支劇情"));
    }

    #[tokio::test]
    async fn compaction_advances_compacted_through_and_is_a_noop_when_not_due() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let config = RecapConfig::default();
        let locks = LockRegistry::new();
        let provider = StubProvider {
            reply: StdMutex::new("主角踏上了冒險的旅程。".to_string()),
        };
        let usage = NullUsageSink;
        let state = CharacterState::new();

        let timeline = timeline_of(60);
        let ran = compact_if_due(&ws, &story, &branch, &timeline, &state, &locks, &provider, &usage, &config)
            .await
            .unwrap();
        assert!(ran);
        let recap = load_recap(&ws, &story, &branch).unwrap();
        assert_eq!(recap.compacted_through_index, 39);
        assert_eq!(recap.total_turns_compacted, 20);

        let ran_again = compact_if_due(&ws, &story, &branch, &timeline, &state, &locks, &provider, &usage, &config)
            .await
            .unwrap();
        assert!(!ran_again);
    }
}
