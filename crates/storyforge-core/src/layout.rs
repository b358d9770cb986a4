use std::path::{Path, PathBuf};
use storyforge_types::{BranchId, StoryId};

/// Root of a storyforge workspace: a directory containing `story_design/`
/// and `data/` (§6). Stories are identified by the caller; this crate never
/// invents or validates ids, only joins paths.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the workspace root the way the CLI does when no `--home`
    /// flag is given: an explicit override, then `STORYFORGE_HOME`, then
    /// the platform data directory, then `~/.storyforge` as a last resort.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        if let Some(root) = explicit {
            return Self::new(root);
        }
        if let Ok(env_root) = std::env::var("STORYFORGE_HOME") {
            if !env_root.is_empty() {
                return Self::new(env_root);
            }
        }
        if let Some(data_dir) = dirs::data_dir() {
            return Self::new(data_dir.join("storyforge"));
        }
        Self::new(
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".storyforge"),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn story_design_root(&self) -> PathBuf {
        self.root.join("story_design")
    }

    pub fn data_root(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn stories_root(&self) -> PathBuf {
        self.data_root().join("stories")
    }

    /// `data/stories.json`, the cross-story registry of `{id, name, ...}`.
    pub fn stories_registry(&self) -> PathBuf {
        self.data_root().join("stories.json")
    }

    pub fn story_design(&self, story: &StoryId) -> StoryDesignPaths {
        StoryDesignPaths::new(self.story_design_root().join(story.as_str()))
    }

    pub fn story(&self, story: &StoryId) -> StoryPaths {
        StoryPaths::new(self.stories_root().join(story.as_str()))
    }

    pub fn branch(&self, story: &StoryId, branch: &BranchId) -> BranchPaths {
        self.story(story).branch(branch)
    }
}

/// Design-time files, authored once per story and read-only at runtime
/// (§6: "Design-time files live under `story_design/<story>/`").
#[derive(Debug, Clone)]
pub struct StoryDesignPaths {
    dir: PathBuf,
}

impl StoryDesignPaths {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn system_prompt(&self) -> PathBuf {
        self.dir.join("system_prompt.txt")
    }

    pub fn character_schema(&self) -> PathBuf {
        self.dir.join("character_schema.json")
    }

    pub fn default_character_state(&self) -> PathBuf {
        self.dir.join("default_character_state.json")
    }

    pub fn parsed_conversation(&self) -> PathBuf {
        self.dir.join("parsed_conversation.json")
    }

    pub fn base_world_lore(&self) -> PathBuf {
        self.dir.join("world_lore.json")
    }
}

/// Per-story runtime files (§6): the branch tree, event/lore/usage
/// databases, and the `branches/<id>/` subtree.
#[derive(Debug, Clone)]
pub struct StoryPaths {
    dir: PathBuf,
}

impl StoryPaths {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeline_tree(&self) -> PathBuf {
        self.dir.join("timeline_tree.json")
    }

    pub fn lore_db(&self) -> PathBuf {
        self.dir.join("lore.db")
    }

    pub fn event_db(&self) -> PathBuf {
        self.dir.join("events.db")
    }

    pub fn usage_db(&self) -> PathBuf {
        self.dir.join("usage.db")
    }

    pub fn branches_root(&self) -> PathBuf {
        self.dir.join("branches")
    }

    pub fn branch(&self, branch: &BranchId) -> BranchPaths {
        BranchPaths::new(self.branches_root().join(branch.as_str()))
    }
}

/// Per-branch files (§6): `branches/<id>/{messages,character_state,npcs,
/// world_day,conversation_recap,agent_snapshots,auto_play_state,gm_cheats,
/// dungeon_progress,npc_activities,auto_play_transcript.md,state.db}`.
#[derive(Debug, Clone)]
pub struct BranchPaths {
    dir: PathBuf,
}

impl BranchPaths {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn messages(&self) -> PathBuf {
        self.dir.join("messages.json")
    }

    pub fn character_state(&self) -> PathBuf {
        self.dir.join("character_state.json")
    }

    pub fn npcs(&self) -> PathBuf {
        self.dir.join("npcs.json")
    }

    pub fn world_day(&self) -> PathBuf {
        self.dir.join("world_day.json")
    }

    pub fn conversation_recap(&self) -> PathBuf {
        self.dir.join("conversation_recap.json")
    }

    pub fn agent_snapshots(&self) -> PathBuf {
        self.dir.join("agent_snapshots.json")
    }

    pub fn auto_play_state(&self) -> PathBuf {
        self.dir.join("auto_play_state.json")
    }

    pub fn gm_cheats(&self) -> PathBuf {
        self.dir.join("gm_cheats.json")
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn dungeon_progress(&self) -> PathBuf {
        self.dir.join("dungeon_progress.json")
    }

    pub fn npc_activities(&self) -> PathBuf {
        self.dir.join("npc_activities.json")
    }

    pub fn auto_play_transcript(&self) -> PathBuf {
        self.dir.join("auto_play_transcript.md")
    }

    pub fn state_db(&self) -> PathBuf {
        self.dir.join("state.db")
    }
}
