use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use storyforge_core::{read_json_or_default, LockRegistry, Workspace};
use storyforge_engine::{branch_tree, schema};
use storyforge_index::{EventIndex, LoreIndex};
use storyforge_providers::{LlmProvider, NullUsageSink, UsageSink};
use storyforge_runtime::config::RuntimeConfig;
use storyforge_runtime::turn::{CommittedTurn, TurnContext, TurnOutcome};
use storyforge_runtime::usage::SqliteUsageSink;
use storyforge_runtime::workers::BackgroundWorkers;
use storyforge_types::{
    Branch, BranchConfig, BranchId, BranchTree, CharacterSchema, CharacterState, LoreEntry,
    Message, Npc, StoryId,
};

use crate::error::{Result, SdkError};
use crate::story::{self, StoryRecord};

/// Everything a story needs beyond the branch tree itself: its search
/// indexes, character schema and background-job dispatcher. Built lazily
/// the first time a story is touched and cached for the `Client`'s
/// lifetime.
struct StoryState {
    lore: Arc<LoreIndex>,
    events: Arc<EventIndex>,
    schema: Arc<CharacterSchema>,
    usage: Arc<dyn UsageSink>,
    workers: Arc<BackgroundWorkers>,
}

/// The public embedding API: a single facade over
/// `storyforge-core`/`storyforge-engine`/`storyforge-index`/
/// `storyforge-runtime` that an embedder (the CLI, a future HTTP server)
/// drives instead of wiring those crates together itself.
pub struct Client {
    ws: Arc<Workspace>,
    locks: Arc<LockRegistry>,
    provider: Arc<dyn LlmProvider>,
    usage_override: Option<Arc<dyn UsageSink>>,
    config: Arc<RuntimeConfig>,
    stories: Mutex<HashMap<StoryId, Arc<StoryState>>>,
}

pub struct ClientBuilder {
    root: Option<PathBuf>,
    provider: Option<Arc<dyn LlmProvider>>,
    usage: Option<Arc<dyn UsageSink>>,
    config: Option<RuntimeConfig>,
}

impl ClientBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// The LLM provider every turn and background job calls through.
    /// Required - no concrete adapter ships with this crate (provider
    /// adapters are out of scope; see `storyforge-providers`).
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Overrides the default per-story `SqliteUsageSink` with a single
    /// sink shared across every story. Mainly useful for tests that want
    /// `NullUsageSink` or a counting stub instead of touching disk.
    pub fn usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Client> {
        let ws = Workspace::discover(self.root);
        let provider = self
            .provider
            .expect("ClientBuilder::provider must be set before build (no default LLM adapter ships with this crate)");
        Ok(Client {
            ws: Arc::new(ws),
            locks: Arc::new(LockRegistry::new()),
            provider,
            usage_override: self.usage,
            config: Arc::new(self.config.unwrap_or_default()),
            stories: Mutex::new(HashMap::new()),
        })
    }
}

/// What `Client::init` reports back, mirroring `POST /api/init`'s response
/// shape (§6).
pub struct InitInfo {
    pub active_story_id: StoryId,
    pub active_branch_id: BranchId,
    pub story_name: String,
    pub original_count: i64,
    pub has_summary: bool,
    pub character_schema: CharacterSchema,
}

/// One page of a branch's reconstructed timeline, matching `GET
/// /api/messages`'s response shape (§6).
pub struct MessagesPage {
    pub messages: Vec<Message>,
    pub total: usize,
    pub offset: usize,
    pub original_count: i64,
    pub fork_points: HashMap<i64, Vec<branch_tree::ForkPoint>>,
    pub sibling_groups: HashMap<i64, branch_tree::SiblingGroup>,
    pub branch_id: BranchId,
    pub world_day: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MessagesQuery {
    pub offset: usize,
    pub limit: Option<usize>,
    /// Returns only the last `tail` messages, ignoring `offset`/`limit`.
    pub tail: Option<usize>,
    /// Returns only messages with `index > after_index`, for polling.
    pub after_index: Option<i64>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            root: None,
            provider: None,
            usage: None,
            config: None,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.ws
    }

    /// The provider every turn calls through. Exposed so callers that drive
    /// their own one-shot calls outside the turn pipeline (an auto-play
    /// player AI, a story-summary backfill) don't need to hold their own
    /// copy of the `Arc` passed to the builder.
    pub fn provider(&self) -> &dyn LlmProvider {
        self.provider.as_ref()
    }

    fn story_state(&self, story: &StoryId) -> Result<Arc<StoryState>> {
        if let Some(existing) = self.stories.lock().expect("story state cache poisoned").get(story) {
            return Ok(Arc::clone(existing));
        }

        let lore = Arc::new(LoreIndex::open(&self.ws.story(story).lore_db())?);
        if lore.all_entries()?.is_empty() {
            let base: Vec<LoreEntry> = read_json_or_default(&self.ws.story_design(story).base_world_lore())?;
            if !base.is_empty() {
                lore.rebuild(&base)?;
            }
        }
        let events = Arc::new(EventIndex::open(&self.ws.story(story).event_db())?);
        let schema = Arc::new(schema::load_schema(&self.ws, story)?);
        let usage: Arc<dyn UsageSink> = match &self.usage_override {
            Some(sink) => Arc::clone(sink),
            None => Arc::new(SqliteUsageSink::for_story(&self.ws, story)?),
        };
        let workers = Arc::new(BackgroundWorkers::new(
            Arc::clone(&self.ws),
            Arc::clone(&self.locks),
            Arc::clone(&lore),
            Arc::clone(&events),
            Arc::clone(&schema),
            Arc::clone(&self.provider),
            Arc::clone(&usage),
            Arc::clone(&self.config),
        ));

        let state = Arc::new(StoryState { lore, events, schema, usage, workers });
        self.stories
            .lock()
            .expect("story state cache poisoned")
            .insert(story.clone(), Arc::clone(&state));
        Ok(state)
    }

    // -- system -----------------------------------------------------------

    /// `POST /api/init` (§6): ensures at least one story exists (scaffolding
    /// a default one if this is a brand-new workspace) and reports which
    /// story/branch is active.
    pub fn init(&self) -> Result<InitInfo> {
        let mut stories = story::list(&self.ws)?;
        if stories.is_empty() {
            let record = story::create(&self.ws, &StoryId::new("story_original"), "原創故事")?;
            stories.push(record);
        }
        let active_id = story::active_story_id(&self.ws)?.unwrap_or_else(|| stories[0].id.clone());
        let record = story::get(&self.ws, &active_id)?;
        let tree = branch_tree::load_tree(&self.ws, &active_id)?;
        let state = self.story_state(&active_id)?;
        Ok(InitInfo {
            active_story_id: active_id,
            active_branch_id: tree.active_branch_id,
            story_name: record.name,
            original_count: record.original_count,
            has_summary: record.has_summary,
            character_schema: (*state.schema).clone(),
        })
    }

    // -- stories ------------------------------------------------------------

    pub fn list_stories(&self) -> Result<Vec<StoryRecord>> {
        story::list(&self.ws)
    }

    pub fn create_story(&self, id: &StoryId, name: &str) -> Result<StoryRecord> {
        story::create(&self.ws, id, name)
    }

    pub fn rename_story(&self, id: &StoryId, name: &str) -> Result<()> {
        story::rename(&self.ws, id, name)
    }

    pub fn switch_story(&self, id: &StoryId) -> Result<()> {
        story::switch(&self.ws, id)
    }

    pub fn delete_story(&self, id: &StoryId) -> Result<()> {
        self.stories.lock().expect("story state cache poisoned").remove(id);
        story::delete(&self.ws, id)
    }

    pub fn story_schema(&self, id: &StoryId) -> Result<CharacterSchema> {
        Ok(schema::load_schema(&self.ws, id)?)
    }

    // -- branches -------------------------------------------------------

    pub fn list_branches(&self, story: &StoryId) -> Result<Vec<Branch>> {
        let tree = branch_tree::load_tree(&self.ws, story)?;
        Ok(tree.listable().cloned().collect())
    }

    fn fork(&self, story: &StoryId, name: &str, parent: &BranchId, branch_point_index: i64) -> Result<Branch> {
        let mut tree = branch_tree::load_tree(&self.ws, story)?;
        let resolved_parent = branch_tree::resolve_sibling_parent(&tree, parent, branch_point_index);
        let branch = branch_tree::create(&self.ws, story, &mut tree, name, parent, branch_point_index)?;
        branch_tree::save_tree(&self.ws, story, &tree)?;

        storyforge_runtime::world_clock::copy_parent_to_child(&self.ws, story, &resolved_parent, &branch.id, false)?;
        storyforge_runtime::recap::copy_recap_to_branch(&self.ws, story, &resolved_parent, &branch.id, branch_point_index)?;
        let state = self.story_state(story)?;
        state.events.copy_for_fork(&resolved_parent, &branch.id, Some(branch_point_index))?;
        Ok(branch)
    }

    pub fn create_branch(&self, story: &StoryId, name: &str, parent: &BranchId, branch_point_index: i64) -> Result<Branch> {
        self.fork(story, name, parent, branch_point_index)
    }

    pub fn create_blank_branch(&self, story: &StoryId, name: &str) -> Result<Branch> {
        let mut tree = branch_tree::load_tree(&self.ws, story)?;
        let branch = branch_tree::create_blank(&self.ws, story, &mut tree, name)?;
        branch_tree::save_tree(&self.ws, story, &tree)?;
        Ok(branch)
    }

    pub fn switch_branch(&self, story: &StoryId, branch: &BranchId) -> Result<()> {
        let mut tree = branch_tree::load_tree(&self.ws, story)?;
        branch_tree::switch_active(&mut tree, branch)?;
        branch_tree::save_tree(&self.ws, story, &tree)?;
        Ok(())
    }

    pub fn rename_branch(&self, story: &StoryId, branch: &BranchId, name: &str) -> Result<()> {
        let mut tree = branch_tree::load_tree(&self.ws, story)?;
        branch_tree::rename(&mut tree, branch, name)?;
        branch_tree::save_tree(&self.ws, story, &tree)?;
        Ok(())
    }

    pub fn promote_branch(&self, story: &StoryId, branch: &BranchId) -> Result<()> {
        let mut tree = branch_tree::load_tree(&self.ws, story)?;
        branch_tree::promote(&self.ws, story, &mut tree, branch)?;
        branch_tree::save_tree(&self.ws, story, &tree)?;
        Ok(())
    }

    pub fn merge_branch(&self, story: &StoryId, branch: &BranchId) -> Result<BranchId> {
        let mut tree = branch_tree::load_tree(&self.ws, story)?;
        let parent = branch_tree::merge(&self.ws, story, &mut tree, branch)?;
        branch_tree::save_tree(&self.ws, story, &tree)?;
        let state = self.story_state(story)?;
        state.events.merge_into(branch, &parent)?;
        Ok(parent)
    }

    pub fn delete_branch(&self, story: &StoryId, branch: &BranchId) -> Result<()> {
        let mut tree = branch_tree::load_tree(&self.ws, story)?;
        branch_tree::delete(&self.ws, story, &mut tree, branch)?;
        branch_tree::save_tree(&self.ws, story, &tree)?;
        let state = self.story_state(story)?;
        state.events.delete_for_branch(branch)?;
        Ok(())
    }

    pub fn branch_config(&self, story: &StoryId, branch: &BranchId) -> Result<BranchConfig> {
        Ok(branch_tree::get_branch_config(&self.ws, story, branch)?)
    }

    pub fn set_branch_config(&self, story: &StoryId, branch: &BranchId, patch: serde_json::Map<String, serde_json::Value>) -> Result<BranchConfig> {
        Ok(branch_tree::set_branch_config(&self.ws, story, branch, patch)?)
    }

    // -- turns ------------------------------------------------------------

    /// Runs one turn and, if it committed, immediately kicks off the
    /// background jobs it unlocked (compaction, structured extraction, NPC
    /// evolution) - an embedder that wants to sequence those differently
    /// should call `storyforge_runtime::turn::run_turn` directly instead.
    pub async fn send_message(
        &self,
        story: &StoryId,
        branch: &BranchId,
        user_text: &str,
        story_summary: &str,
    ) -> Result<TurnOutcome> {
        let state = self.story_state(story)?;
        let ctx = TurnContext {
            ws: &self.ws,
            locks: &self.locks,
            lore: &state.lore,
            events: &state.events,
            schema: &state.schema,
            provider: self.provider.as_ref(),
            usage: state.usage.as_ref(),
            config: &self.config,
        };
        let outcome = storyforge_runtime::turn::run_turn(&ctx, story, branch, user_text, story_summary, None, None).await?;
        if let TurnOutcome::Turn(ref turn) = outcome {
            state.workers.dispatch_after_turn(story, branch, turn);
        }
        Ok(outcome)
    }

    fn full_timeline(&self, story: &StoryId, branch: &BranchId) -> Result<(BranchTree, Vec<Message>)> {
        let tree = branch_tree::load_tree(&self.ws, story)?;
        let timeline = branch_tree::full_timeline(&self.ws, story, &tree, branch)?;
        Ok((tree, timeline))
    }

    /// `POST /api/branches/edit` (§6): forks at the point just before
    /// `message_index` and re-runs the turn with `new_text` in place of
    /// what the player originally sent.
    pub async fn edit_message(
        &self,
        story: &StoryId,
        branch: &BranchId,
        message_index: i64,
        new_text: &str,
        story_summary: &str,
    ) -> Result<(BranchId, TurnOutcome)> {
        let (_tree, timeline) = self.full_timeline(story, branch)?;
        let target = timeline
            .iter()
            .find(|m| m.index == message_index)
            .ok_or_else(|| SdkError::MessageNotFound { branch: branch.as_str().to_string(), index: message_index })?;
        if target.role != storyforge_types::Role::User {
            return Err(SdkError::NotAPlayerMessage { branch: branch.as_str().to_string(), index: message_index });
        }

        let name = format!("edit-{message_index}");
        let forked = self.fork(story, &name, branch, message_index - 1)?;
        let outcome = self.send_message(story, &forked.id, new_text, story_summary).await?;
        Ok((forked.id, outcome))
    }

    /// `POST /api/branches/regenerate` (§6): forks at the point just before
    /// the player turn that produced `message_index`'s GM reply and re-runs
    /// it, producing a sibling reply under a new branch.
    pub async fn regenerate_message(
        &self,
        story: &StoryId,
        branch: &BranchId,
        message_index: i64,
        story_summary: &str,
    ) -> Result<(BranchId, TurnOutcome)> {
        let (_tree, timeline) = self.full_timeline(story, branch)?;
        let target = timeline
            .iter()
            .find(|m| m.index == message_index)
            .ok_or_else(|| SdkError::MessageNotFound { branch: branch.as_str().to_string(), index: message_index })?;
        if target.role != storyforge_types::Role::Gm {
            return Err(SdkError::NotAPlayerMessage { branch: branch.as_str().to_string(), index: message_index });
        }
        let user_message = timeline
            .iter()
            .find(|m| m.index == message_index - 1)
            .ok_or_else(|| SdkError::MessageNotFound { branch: branch.as_str().to_string(), index: message_index - 1 })?
            .clone();

        let name = format!("regen-{message_index}");
        let forked = self.fork(story, &name, branch, message_index - 2)?;
        let outcome = self.send_message(story, &forked.id, &user_message.content, story_summary).await?;
        Ok((forked.id, outcome))
    }

    /// `GET /api/messages` (§6): a branch's reconstructed timeline plus the
    /// fork/sibling markers a UI uses to surface "this turn has siblings".
    pub fn messages(&self, story: &StoryId, branch: &BranchId, query: MessagesQuery) -> Result<MessagesPage> {
        let tree = branch_tree::load_tree(&self.ws, story)?;
        let mut timeline = branch_tree::full_timeline(&self.ws, story, &tree, branch)?;
        if let Some(after) = query.after_index {
            timeline.retain(|m| m.index > after);
        }
        let total = timeline.len();

        let page = if let Some(tail) = query.tail {
            let start = total.saturating_sub(tail);
            timeline[start..].to_vec()
        } else {
            let start = query.offset.min(total);
            let end = query.limit.map(|l| (start + l).min(total)).unwrap_or(total);
            timeline[start..end].to_vec()
        };

        let original_count = {
            let parsed: Vec<Message> = read_json_or_default(&self.ws.story_design(story).parsed_conversation())?;
            parsed.len() as i64
        };
        let world_day = storyforge_runtime::world_clock::get_world_day(&self.ws, story, branch)?;

        Ok(MessagesPage {
            messages: page,
            total,
            offset: query.offset,
            original_count,
            fork_points: branch_tree::fork_points(&tree, branch),
            sibling_groups: branch_tree::sibling_groups(&self.ws, story, &tree, branch)?,
            branch_id: branch.clone(),
            world_day,
        })
    }

    // -- lore / npcs / events --------------------------------------------

    pub fn search_lore(&self, story: &StoryId, query: &str, limit: usize) -> Result<Vec<storyforge_index::lore::LoreHit>> {
        Ok(self.story_state(story)?.lore.search(query, limit)?)
    }

    pub fn upsert_lore(&self, story: &StoryId, entry: &LoreEntry) -> Result<()> {
        Ok(self.story_state(story)?.lore.upsert(entry)?)
    }

    pub fn npcs(&self, story: &StoryId, branch: &BranchId) -> Result<Vec<Npc>> {
        Ok(storyforge_engine::npc::load_npcs(&self.ws, story, branch)?)
    }

    pub fn upsert_npc(&self, story: &StoryId, branch: &BranchId, npc: Npc) -> Result<()> {
        Ok(storyforge_engine::npc::upsert_npc(&self.ws, story, branch, npc)?)
    }

    pub fn character_state(&self, story: &StoryId, branch: &BranchId) -> Result<CharacterState> {
        Ok(read_json_or_default(&self.ws.branch(story, branch).character_state())?)
    }

    /// Overwrites a branch's character state wholesale. Used by callers that
    /// seed a freshly-created branch with a specific character (e.g. an
    /// auto-play driver placing a generated character card), as opposed to
    /// the incremental updates `turn::run_turn` applies from STATE tags.
    pub fn set_character_state(&self, story: &StoryId, branch: &BranchId, state: &CharacterState) -> Result<()> {
        storyforge_core::write_json_atomic(&self.ws.branch(story, branch).character_state(), state)?;
        Ok(())
    }

    /// Overwrites a branch's NPC roster wholesale, same rationale as
    /// `set_character_state`.
    pub fn set_npcs(&self, story: &StoryId, branch: &BranchId, npcs: &[Npc]) -> Result<()> {
        storyforge_engine::npc::save_npcs(&self.ws, story, branch, npcs)?;
        Ok(())
    }

    pub fn world_day(&self, story: &StoryId, branch: &BranchId) -> Result<f64> {
        Ok(storyforge_runtime::world_clock::get_world_day(&self.ws, story, branch)?)
    }
}

pub use CommittedTurn as Turn;
