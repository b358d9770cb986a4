//! The turn pipeline (§4.10, §9): the one place that stitches context
//! assembly, the LLM call, and every tag-driven side effect into a single
//! committed turn under the branch's write lock. Grounded on the
//! original's `app.py::send_message` / `_handle_gm_response`.
//!
//! Background follow-up work (compaction, structured extraction, NPC
//! evolution, snapshot summaries) is deliberately *not* dispatched from
//! here — [`CommittedTurn`] carries everything a caller needs to kick
//! those off itself (see `crate::workers`), keeping the synchronous commit
//! path free of fire-and-forget bookkeeping.

use serde_json::{Map, Value};
use storyforge_core::{read_json_or_default, write_json_atomic, LockRegistry, Workspace};
use storyforge_engine::tag_parser::{self, ExtractedTags};
use storyforge_engine::{branch_tree, cheats, npc, state_updater};
use storyforge_index::{EventIndex, LoreIndex};
use storyforge_providers::{call_type, GmRequest, LlmProvider, UsageRecord, UsageSink};
use storyforge_types::{
    BranchId, CharacterSchema, CharacterState, DiceResult, Event, EventStatus, ImageInfo,
    LoreEntry, Message, Npc, Role, Snapshots, StoryId,
};

use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{Result, RuntimeError};
use crate::recap;
use crate::world_clock;

/// The read-only collaborators a turn needs, bundled so `run_turn`'s
/// signature doesn't grow a parameter per crate. Built once by the
/// embedder (sdk/cli) and reused across turns.
pub struct TurnContext<'a> {
    pub ws: &'a Workspace,
    pub locks: &'a LockRegistry,
    pub lore: &'a LoreIndex,
    pub events: &'a EventIndex,
    pub schema: &'a CharacterSchema,
    pub provider: &'a dyn LlmProvider,
    pub usage: &'a dyn UsageSink,
    pub config: &'a RuntimeConfig,
}

/// What `run_turn` produced.
pub enum TurnOutcome {
    /// `user_text` was a `/gm` command; applied directly, no LLM call made.
    Cheat(cheats::DiceCommandResult),
    /// A full turn committed.
    Turn(CommittedTurn),
}

/// Everything a caller needs after a turn commits: the new messages, the
/// post-effects state, and enough context to decide whether background
/// work (compaction, extraction, NPC evolution) is worth kicking off.
pub struct CommittedTurn {
    pub user_message_index: i64,
    pub gm_message_index: i64,
    pub gm_text: String,
    pub dice: Option<DiceResult>,
    pub tags: ExtractedTags,
    pub state: CharacterState,
    pub npcs: Vec<Npc>,
    pub world_day: f64,
    /// True if a STATE tag in the GM's reply already applied an update
    /// this turn — the structured-extraction worker should skip applying
    /// its own STATE guess on top (see `crate::extraction::run_extraction`'s
    /// `skip_state` parameter).
    pub skip_state_extraction: bool,
    /// The branch's team mode at commit time, so `crate::workers` can
    /// decide whether to append a §4.12 agent snapshot without re-reading
    /// the branch config itself.
    pub team_mode: String,
    /// The branch's hub/dungeon phase after this turn's transition check.
    pub dungeon_phase: String,
}

fn load_messages(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<Vec<Message>> {
    Ok(read_json_or_default(&ws.branch(story, branch).messages())?)
}

fn save_messages(ws: &Workspace, story: &StoryId, branch: &BranchId, messages: &[Message]) -> Result<()> {
    write_json_atomic(&ws.branch(story, branch).messages(), &messages.to_vec())?;
    Ok(())
}

fn next_index(messages: &[Message]) -> i64 {
    messages.last().map(|m| m.index + 1).unwrap_or(0)
}

pub(crate) fn completed_missions_of(state: &CharacterState) -> Vec<String> {
    state
        .get("completed_missions")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn always_success_cheat(gm_cheats: &cheats::GmCheats) -> bool {
    gm_cheats.extra.get("always_success").and_then(Value::as_bool).unwrap_or(false)
}

#[derive(Debug, serde::Deserialize)]
struct TaggedEvent {
    event_type: String,
    title: String,
    description: String,
    #[serde(default = "default_event_status")]
    status: EventStatus,
    #[serde(default)]
    tags: String,
}

fn default_event_status() -> EventStatus {
    EventStatus::Planted
}

/// Runs one full turn: persists the user message, assembles context, calls
/// the LLM, then applies every side effect the reply's tags request.
///
/// `/gm` commands short-circuit before any of that — they never touch the
/// timeline or the LLM.
pub async fn run_turn(
    ctx: &TurnContext<'_>,
    story: &StoryId,
    branch: &BranchId,
    user_text: &str,
    story_summary: &str,
    other_agents: Option<&str>,
    critical_facts: Option<&str>,
) -> Result<TurnOutcome> {
    let user_text = user_text.trim();
    if user_text.is_empty() {
        return Err(RuntimeError::EmptyMessage);
    }

    let tree = branch_tree::load_tree(ctx.ws, story)?;
    let branch_record = tree
        .get(branch)
        .ok_or_else(|| RuntimeError::BranchNotWritable(branch.as_str().to_string()))?
        .clone();
    if !branch_record.is_writable() {
        return Err(RuntimeError::BranchNotWritable(branch.as_str().to_string()));
    }

    if cheats::is_gm_command(user_text) {
        return match cheats::apply_dice_command(ctx.ws, story, branch, user_text)? {
            Some(result) => Ok(TurnOutcome::Cheat(result)),
            None => Err(RuntimeError::ProviderError(format!("unrecognized /gm command: {user_text}"))),
        };
    }

    let guard = ctx.locks.branch_lock(story, branch);
    let _guard = guard.lock().expect("branch lock poisoned");

    let mut timeline = load_messages(ctx.ws, story, branch)?;
    // Indices must continue the branch's *full* ancestor-aware sequence, not
    // restart from this branch's own (possibly empty) delta file — a freshly
    // forked branch has an empty delta but inherits everything up to its
    // branch point (§4.11: delta indices are strictly greater than
    // branch_point_index).
    let full_timeline = branch_tree::full_timeline(ctx.ws, story, &tree, branch)?;
    let user_index = next_index(&full_timeline);
    let state: CharacterState = read_json_or_default(&ctx.ws.branch(story, branch).character_state())?;
    let npcs = npc::load_npcs(ctx.ws, story, branch)?;
    let branch_config = branch_tree::get_branch_config(ctx.ws, story, branch)?;
    let recap = recap::load_recap(ctx.ws, story, branch)?;
    let branch_cheats = cheats::load_cheats(ctx.ws, story, branch)?;
    let activities = crate::npc_evolution::get_recent_activities(ctx.ws, story, branch, 5)?;
    let dungeon_progress = crate::phase::load_dungeon_progress(ctx.ws, story, branch)?;

    let state_index = match storyforge_index::StateIndex::open(&ctx.ws.branch(story, branch).state_db()) {
        Ok(index) => {
            if let Err(err) = index.rebuild_from_json(&state, &npcs) {
                tracing::warn!(%story, %branch, error = %err, "state index rebuild failed, skipping C5 retrieval");
            }
            Some(index)
        }
        Err(err) => {
            tracing::warn!(%story, %branch, error = %err, "state index open failed, skipping C5 retrieval");
            None
        }
    };

    let augmented = context::build_augmented_message(
        ctx.lore,
        ctx.events,
        state_index.as_ref(),
        branch,
        user_text,
        Some(&state),
        branch_cheats.dice_modifier(),
        always_success_cheat(&branch_cheats),
        &activities,
        branch_record.is_blank(),
        &dungeon_progress.phase,
    )?;

    let mut user_message = Message::user(user_index, user_text);
    user_message.dice = augmented.dice.clone();
    timeline.push(user_message);
    save_messages(ctx.ws, story, branch, &timeline)?;

    let system_prompt = context::build_system_prompt(
        ctx.ws,
        story,
        &state,
        story_summary,
        ctx.lore,
        &npcs,
        &branch_config,
        recap.display_text(),
        branch_record.is_blank(),
        other_agents,
        critical_facts,
    )?;

    let recent = context::sanitize_recent_messages(recap::context_window(&timeline, &ctx.config.recap));

    let t0 = std::time::Instant::now();
    let reply = ctx
        .provider
        .call_gm(GmRequest {
            user_message: &augmented.text,
            system_prompt: &system_prompt,
            recent: &recent,
            session_id: branch_record.session_id.as_deref(),
        })
        .await;
    let elapsed_ms = t0.elapsed().as_millis() as i64;

    ctx.usage
        .log(
            story,
            UsageRecord {
                timestamp: chrono::Utc::now(),
                provider: ctx.provider.name().to_string(),
                model: String::new(),
                call_type: call_type::GM_TURN.to_string(),
                prompt_tokens: None,
                output_tokens: None,
                total_tokens: None,
                branch_id: branch.clone(),
                elapsed_ms: Some(elapsed_ms),
            },
        )
        .await;

    if reply.is_error() {
        timeline.pop();
        save_messages(ctx.ws, story, branch, &timeline)?;
        return Err(RuntimeError::ProviderError(reply.text));
    }

    if reply.session_id.is_some() && reply.session_id != branch_record.session_id {
        let mut tree = branch_tree::load_tree(ctx.ws, story)?;
        if let Some(b) = tree.get_mut(branch) {
            b.session_id = reply.session_id.clone();
        }
        branch_tree::save_tree(ctx.ws, story, &tree)?;
    }

    let cleaned = tag_parser::strip_context_echo(&reply.text);
    let (narrative, tags) = tag_parser::extract_tags(&cleaned);

    let mut state = state;
    let mut skip_state_extraction = false;
    for raw in &tags.state {
        let Value::Object(update) = raw else { continue };
        state = apply_state_update(ctx, story, branch, update).await?;
        skip_state_extraction = true;
    }

    for raw in &tags.lore {
        if let Ok(entry) = serde_json::from_value::<LoreEntry>(raw.clone()) {
            ctx.lore.upsert(&entry)?;
        }
    }

    for raw in &tags.npc {
        if let Ok(record) = serde_json::from_value::<Npc>(raw.clone()) {
            if !record.name.trim().is_empty() {
                npc::upsert_npc(ctx.ws, story, branch, record)?;
            }
        }
    }

    let gm_index = next_index(&timeline);
    for raw in &tags.event {
        if let Ok(tagged) = serde_json::from_value::<TaggedEvent>(raw.clone()) {
            ctx.events.insert(&Event {
                id: None,
                event_type: tagged.event_type,
                title: tagged.title,
                description: tagged.description,
                status: tagged.status,
                tags: tagged.tags,
                related_titles: String::new(),
                message_index: Some(gm_index),
                branch_id: branch.clone(),
                created_at: chrono::Utc::now(),
            })?;
        }
    }

    let world_day = world_clock::apply_time_advances(ctx.ws, story, branch, &tags.time_advances)?;
    let npcs = npc::load_npcs(ctx.ws, story, branch)?;
    let dungeon_progress = crate::phase::update_dungeon_progress(ctx.ws, story, branch, &narrative, world_day)?;

    let image = tags.image_prompt.as_ref().map(|prompt| ImageInfo {
        prompt: prompt.clone(),
        path: None,
        status: Some("pending".to_string()),
    });

    let mut gm_message = Message::gm(gm_index, narrative.clone());
    gm_message.image = image;
    gm_message.snapshots = Some(Snapshots {
        state_snapshot: state.clone(),
        npcs_snapshot: npcs.clone(),
        world_day_snapshot: world_day,
    });
    timeline.push(gm_message);
    save_messages(ctx.ws, story, branch, &timeline)?;

    Ok(TurnOutcome::Turn(CommittedTurn {
        user_message_index: user_index,
        gm_message_index: gm_index,
        gm_text: narrative,
        dice: augmented.dice,
        tags,
        state,
        npcs,
        world_day,
        skip_state_extraction,
        team_mode: branch_config.team_mode().to_string(),
        dungeon_phase: dungeon_progress.phase,
    }))
}

async fn apply_state_update(
    ctx: &TurnContext<'_>,
    story: &StoryId,
    branch: &BranchId,
    update: &Map<String, Value>,
) -> Result<CharacterState> {
    let outcome = crate::review::review_state_update(update, ctx.schema, ctx.config.state_review_mode, ctx.provider).await;
    Ok(state_updater::apply(ctx.ws, story, branch, &outcome.update, ctx.schema)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use storyforge_providers::{GmReply, NullUsageSink, StreamEvent};
    use storyforge_types::BranchId;
    use tempfile::tempdir;

    struct StubProvider {
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        async fn call_gm(&self, _request: GmRequest<'_>) -> GmReply {
            GmReply {
                text: self.reply.clone(),
                session_id: None,
            }
        }
        async fn call_gm_stream(&self, _request: GmRequest<'_>, _tx: tokio::sync::mpsc::UnboundedSender<StreamEvent>) {}
        async fn call_oneshot(&self, _prompt: &str, _system_prompt: Option<&str>) -> String {
            String::new()
        }
        async fn generate_story_summary(&self, _conversation_text: &str) -> String {
            String::new()
        }
        async fn web_search(&self, _query: &str) -> String {
            String::new()
        }
    }

    fn setup() -> (tempfile::TempDir, Workspace, LockRegistry, LoreIndex, EventIndex, CharacterSchema, RuntimeConfig) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let tree = storyforge_types::BranchTree::new(storyforge_types::Branch::root(chrono::Utc::now()));
        branch_tree::save_tree(&ws, &story, &tree).unwrap();
        std::fs::create_dir_all(ws.branch(&story, &branch).dir()).unwrap();
        (
            dir,
            ws,
            LockRegistry::new(),
            LoreIndex::open_in_memory().unwrap(),
            EventIndex::open_in_memory().unwrap(),
            storyforge_engine::schema::default_schema(),
            RuntimeConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (_dir, ws, locks, lore, events, schema, config) = setup();
        let provider = StubProvider { reply: "hi".to_string() };
        let usage = NullUsageSink;
        let ctx = TurnContext {
            ws: &ws,
            locks: &locks,
            lore: &lore,
            events: &events,
            schema: &schema,
            provider: &provider,
            usage: &usage,
            config: &config,
        };
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let err = run_turn(&ctx, &story, &branch, "   ", "", None, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::EmptyMessage));
    }

    #[tokio::test]
    async fn committed_turn_saves_user_and_gm_messages() {
        let (_dir, ws, locks, lore, events, schema, config) = setup();
        let provider = StubProvider {
            reply: "故事繼續。".to_string(),
        };
        let usage = NullUsageSink;
        let ctx = TurnContext {
            ws: &ws,
            locks: &locks,
            lore: &lore,
            events: &events,
            schema: &schema,
            provider: &provider,
            usage: &usage,
            config: &config,
        };
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let outcome = run_turn(&ctx, &story, &branch, "我往前走。", "", None, None).await.unwrap();
        let TurnOutcome::Turn(turn) = outcome else {
            panic!("expected a committed turn");
        };
        assert_eq!(turn.gm_message_index, 1);
        assert_eq!(turn.gm_text, "故事繼續。");

        let saved = load_messages(&ws, &story, &branch).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].role, Role::User);
        assert_eq!(saved[1].role, Role::Gm);
        assert!(saved[1].snapshots.is_some());
    }

    #[tokio::test]
    async fn provider_error_rolls_back_the_user_message() {
        let (_dir, ws, locks, lore, events, schema, config) = setup();
        let provider = StubProvider {
            reply: format!("{}請求過於頻繁", storyforge_providers::ERROR_MARKER),
        };
        let usage = NullUsageSink;
        let ctx = TurnContext {
            ws: &ws,
            locks: &locks,
            lore: &lore,
            events: &events,
            schema: &schema,
            provider: &provider,
            usage: &usage,
            config: &config,
        };
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let err = run_turn(&ctx, &story, &branch, "我往前走。", "", None, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ProviderError(_)));
        assert!(load_messages(&ws, &story, &branch).unwrap().is_empty());
    }

    #[tokio::test]
    async fn gm_command_applies_without_calling_the_provider() {
        let (_dir, ws, locks, lore, events, schema, config) = setup();
        let provider = StubProvider {
            reply: "should not be called".to_string(),
        };
        let usage = NullUsageSink;
        let ctx = TurnContext {
            ws: &ws,
            locks: &locks,
            lore: &lore,
            events: &events,
            schema: &schema,
            provider: &provider,
            usage: &usage,
            config: &config,
        };
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let outcome = run_turn(&ctx, &story, &branch, "/gm dice +10", "", None, None).await.unwrap();
        let TurnOutcome::Cheat(result) = outcome else {
            panic!("expected a cheat outcome");
        };
        assert_eq!(result.new, 10);
        assert!(load_messages(&ws, &story, &branch).unwrap().is_empty());
    }

    #[tokio::test]
    async fn forked_branch_continues_the_absolute_index_sequence() {
        let (_dir, ws, locks, lore, events, schema, config) = setup();
        let provider = StubProvider {
            reply: "故事繼續。".to_string(),
        };
        let usage = NullUsageSink;
        let ctx = TurnContext {
            ws: &ws,
            locks: &locks,
            lore: &lore,
            events: &events,
            schema: &schema,
            provider: &provider,
            usage: &usage,
            config: &config,
        };
        let story = StoryId::new("s1");
        let root = BranchId::root();
        let outcome = run_turn(&ctx, &story, &root, "我往前走。", "", None, None).await.unwrap();
        let TurnOutcome::Turn(first) = outcome else {
            panic!("expected a committed turn");
        };
        assert_eq!(first.user_message_index, 0);
        assert_eq!(first.gm_message_index, 1);

        let mut tree = branch_tree::load_tree(&ws, &story).unwrap();
        let forked = branch_tree::create(&ws, &story, &mut tree, "fork", &root, 1).unwrap();
        branch_tree::save_tree(&ws, &story, &tree).unwrap();

        // The forked branch's own delta starts empty, but a turn run against
        // it must keep numbering from the parent's timeline rather than
        // restarting at 0 (§4.11, Testable Property Invariant 1).
        let outcome = run_turn(&ctx, &story, &forked.id, "我查看四周。", "", None, None).await.unwrap();
        let TurnOutcome::Turn(second) = outcome else {
            panic!("expected a committed turn");
        };
        assert_eq!(second.user_message_index, 2);
        assert_eq!(second.gm_message_index, 3);

        let delta = load_messages(&ws, &story, &forked.id).unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].index, 2);
        assert_eq!(delta[1].index, 3);
    }
}
