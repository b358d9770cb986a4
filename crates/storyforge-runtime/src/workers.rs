//! Background-job dispatch after a turn commits (§4.13): compaction,
//! structured extraction, and NPC evolution all run off the hot path so a
//! player's next turn never waits on them.
//!
//! Grounded on the teacher's `agtrace-runtime/src/runtime/supervisor.rs`:
//! that module dedups filesystem events per session with an
//! `Arc<Mutex<HashSet<String>>>` guarding a `std::thread`-based watcher
//! loop. This crate is async-native end to end, so the same dedup idiom is
//! adapted onto `tokio::spawn` instead of a dedicated OS thread — one
//! in-flight job per `(story, branch)` per job kind, tracked in a
//! `Mutex<HashSet<(StoryId, BranchId)>>` claimed before spawning and
//! released when the task finishes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use storyforge_core::{read_json_or_default, LockRegistry, Workspace};
use storyforge_index::{EventIndex, LoreIndex};
use storyforge_providers::{LlmProvider, UsageSink};
use storyforge_types::{BranchId, CharacterSchema, Message, StoryId};
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::context;
use crate::extraction;
use crate::npc_evolution::{self, EvolutionTracker};
use crate::recap;
use crate::review;
use crate::turn::CommittedTurn;

type BranchKey = (StoryId, BranchId);
type Claims = Mutex<HashSet<BranchKey>>;

fn try_claim(claims: &Claims, key: &BranchKey) -> bool {
    claims.lock().expect("worker claim set poisoned").insert(key.clone())
}

fn release(claims: &Claims, key: &BranchKey) {
    claims.lock().expect("worker claim set poisoned").remove(key);
}

fn load_timeline(ws: &Workspace, story: &StoryId, branch: &BranchId) -> anyhow::Result<Vec<Message>> {
    Ok(read_json_or_default(&ws.branch(story, branch).messages())?)
}

/// Owns the collaborators every background job needs and the per-job-kind
/// dedup sets. Long-lived: one instance per running embedder, shared
/// across every turn.
pub struct BackgroundWorkers {
    ws: Arc<Workspace>,
    locks: Arc<LockRegistry>,
    lore: Arc<LoreIndex>,
    events: Arc<EventIndex>,
    schema: Arc<CharacterSchema>,
    provider: Arc<dyn LlmProvider>,
    usage: Arc<dyn UsageSink>,
    config: Arc<RuntimeConfig>,
    evolution_tracker: Arc<EvolutionTracker>,
    compacting: Claims,
    extracting: Claims,
    evolving: Claims,
    summarizing: Claims,
    normalizing: Claims,
    snapshotting: Claims,
}

impl BackgroundWorkers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ws: Arc<Workspace>,
        locks: Arc<LockRegistry>,
        lore: Arc<LoreIndex>,
        events: Arc<EventIndex>,
        schema: Arc<CharacterSchema>,
        provider: Arc<dyn LlmProvider>,
        usage: Arc<dyn UsageSink>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            ws,
            locks,
            lore,
            events,
            schema,
            provider,
            usage,
            config,
            evolution_tracker: Arc::new(EvolutionTracker::new()),
            compacting: Mutex::new(HashSet::new()),
            extracting: Mutex::new(HashSet::new()),
            evolving: Mutex::new(HashSet::new()),
            summarizing: Mutex::new(HashSet::new()),
            normalizing: Mutex::new(HashSet::new()),
            snapshotting: Mutex::new(HashSet::new()),
        }
    }

    /// Spawns every job a just-committed turn can trigger. Returns the
    /// handles so callers that want to (tests, a CLI's graceful shutdown)
    /// can await them; a normal turn loop drops them and moves on.
    pub fn dispatch_after_turn(self: &Arc<Self>, story: &StoryId, branch: &BranchId, turn: &CommittedTurn) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(h) = self.spawn_compaction(story, branch) {
            handles.push(h);
        }
        if let Some(h) = self.spawn_extraction(story, branch, turn) {
            handles.push(h);
        }
        if let Some(h) = self.spawn_npc_evolution(story, branch, turn) {
            handles.push(h);
        }
        if let Some(h) = self.spawn_state_normalization(story, branch, turn) {
            handles.push(h);
        }
        if let Some(h) = self.spawn_agent_snapshot(story, branch, turn) {
            handles.push(h);
        }
        if let Some(h) = self.spawn_snapshot_summaries(story, branch) {
            handles.push(h);
        }
        handles
    }

    fn spawn_compaction(self: &Arc<Self>, story: &StoryId, branch: &BranchId) -> Option<JoinHandle<()>> {
        let key = (story.clone(), branch.clone());
        if !try_claim(&self.compacting, &key) {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let (story, branch) = key;
            let result = async {
                let timeline = load_timeline(&this.ws, &story, &branch)?;
                let state = read_json_or_default(&this.ws.branch(&story, &branch).character_state())?;
                recap::compact_if_due(
                    &this.ws,
                    &story,
                    &branch,
                    &timeline,
                    &state,
                    &this.locks,
                    this.provider.as_ref(),
                    this.usage.as_ref(),
                    &this.config.recap,
                )
                .await
            }
            .await;
            if let Err(err) = result {
                tracing::warn!(%story, %branch, error = %err, "compaction pass failed");
            }
            release(&this.compacting, &(story, branch));
        }))
    }

    fn spawn_extraction(self: &Arc<Self>, story: &StoryId, branch: &BranchId, turn: &CommittedTurn) -> Option<JoinHandle<()>> {
        let key = (story.clone(), branch.clone());
        if !try_claim(&self.extracting, &key) {
            return None;
        }
        let this = Arc::clone(self);
        let message_index = turn.gm_message_index;
        let gm_text = turn.gm_text.clone();
        let skip_state = turn.skip_state_extraction;
        Some(tokio::spawn(async move {
            let (story, branch) = key;
            let result = extraction::run_extraction(
                &this.ws,
                &story,
                &branch,
                message_index,
                &gm_text,
                &this.schema,
                skip_state,
                this.config.state_review_mode,
                &this.lore,
                &this.events,
                this.provider.as_ref(),
                this.usage.as_ref(),
            )
            .await;
            if let Err(err) = result {
                tracing::warn!(%story, %branch, error = %err, "structured extraction failed");
            }
            release(&this.extracting, &(story, branch));
        }))
    }

    fn spawn_npc_evolution(self: &Arc<Self>, story: &StoryId, branch: &BranchId, turn: &CommittedTurn) -> Option<JoinHandle<()>> {
        let turn_index = (turn.user_message_index + 1).max(0) as u64;
        if !self.evolution_tracker.should_run(story, branch, turn_index, &self.config.npc_evolution) {
            return None;
        }
        let key = (story.clone(), branch.clone());
        if !try_claim(&self.evolving, &key) {
            return None;
        }
        let this = Arc::clone(self);
        let npc_profiles = context::build_npc_text(&turn.npcs);
        let recent_context = turn.gm_text.clone();
        Some(tokio::spawn(async move {
            let (story, branch) = key;
            let result = npc_evolution::run_evolution(
                &this.ws,
                &story,
                &branch,
                turn_index,
                &npc_profiles,
                &recent_context,
                &this.evolution_tracker,
                this.provider.as_ref(),
                this.usage.as_ref(),
            )
            .await;
            if let Err(err) = result {
                tracing::warn!(%story, %branch, error = %err, "NPC evolution pass failed");
            }
            release(&this.evolving, &(story, branch));
        }))
    }

    /// Remaps any STATE tags from this turn that carried keys outside the
    /// schema's known vocabulary (§4.9). A no-op per update when nothing was
    /// unknown — `review::normalize_unknown_keys` checks that itself.
    fn spawn_state_normalization(self: &Arc<Self>, story: &StoryId, branch: &BranchId, turn: &CommittedTurn) -> Option<JoinHandle<()>> {
        let updates: Vec<Map<String, Value>> = turn
            .tags
            .state
            .iter()
            .filter_map(|raw| raw.as_object().cloned())
            .collect();
        if updates.is_empty() {
            return None;
        }
        let key = (story.clone(), branch.clone());
        if !try_claim(&self.normalizing, &key) {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let (story, branch) = key;
            for update in &updates {
                let result = review::normalize_unknown_keys(&this.ws, &story, &branch, update, &this.schema, this.provider.as_ref()).await;
                if let Err(err) = result {
                    tracing::warn!(%story, %branch, error = %err, "state key normalization failed");
                }
            }
            release(&this.normalizing, &(story, branch));
        }))
    }

    /// Appends this turn's §4.12 agent snapshot for team-mode branches.
    /// Runs off the hot path because `crate::snapshots::save_agent_snapshot`
    /// re-acquires the branch lock `run_turn` already holds for the commit
    /// itself — dispatching here, after the commit's guard has dropped,
    /// keeps the two acquisitions from nesting.
    fn spawn_agent_snapshot(self: &Arc<Self>, story: &StoryId, branch: &BranchId, turn: &CommittedTurn) -> Option<JoinHandle<()>> {
        if turn.team_mode == "free_agent" {
            return None;
        }
        let key = (story.clone(), branch.clone());
        if !try_claim(&self.snapshotting, &key) {
            return None;
        }
        let this = Arc::clone(self);
        let world_day = turn.world_day;
        let phase = turn.dungeon_phase.clone();
        let state = turn.state.clone();
        let completed_missions = crate::turn::completed_missions_of(&turn.state);
        Some(tokio::spawn(async move {
            let (story, branch) = key;
            let result = crate::snapshots::next_turn_number(&this.ws, &story, &branch).and_then(|turn_number| {
                crate::snapshots::save_agent_snapshot(
                    &this.ws,
                    &this.locks,
                    &story,
                    &branch,
                    world_day,
                    turn_number,
                    &phase,
                    &state,
                    completed_missions,
                    String::new(),
                )
            });
            if let Err(err) = result {
                tracing::warn!(%story, %branch, error = %err, "agent snapshot save failed");
            }
            release(&this.snapshotting, &(story, branch));
        }))
    }

    /// Fills in missing one-line summaries across a branch's agent
    /// snapshots (§4.12). Runs after every committed turn and whenever a
    /// caller maintaining a multi-agent roster invokes it directly after
    /// `snapshots::save_agent_snapshot`.
    pub fn spawn_snapshot_summaries(self: &Arc<Self>, story: &StoryId, branch: &BranchId) -> Option<JoinHandle<()>> {
        let key = (story.clone(), branch.clone());
        if !try_claim(&self.summarizing, &key) {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let (story, branch) = key;
            let result = crate::snapshots::generate_snapshot_summaries(
                &this.ws,
                &this.locks,
                &story,
                &branch,
                this.provider.as_ref(),
                this.usage.as_ref(),
            )
            .await;
            if let Err(err) = result {
                tracing::warn!(%story, %branch, error = %err, "snapshot summary pass failed");
            }
            release(&this.summarizing, &(story, branch));
        }))
    }
}
