//! Domain model for the storyforge narrative engine.
//!
//! This crate holds plain data: branches, messages, character state, NPCs,
//! lore, events, recaps, snapshots, dice results and the tag payloads parsed
//! out of model output. It has no filesystem or SQLite dependency — those
//! live in `storyforge-core` and `storyforge-index` respectively.

pub mod branch;
pub mod character_state;
pub mod dice;
pub mod dungeon;
pub mod event;
pub mod ids;
pub mod lore;
pub mod message;
pub mod npc;
pub mod recap;
pub mod snapshot;
pub mod tag;

pub use branch::{Branch, BranchConfig, BranchTree};
pub use character_state::{CharacterSchema, CharacterState, FieldType, ListDef, ListType};
pub use dice::{DiceResult, DiceTable, Outcome};
pub use dungeon::DungeonProgress;
pub use event::{Event, EventStatus};
pub use ids::{BranchId, StoryId};
pub use lore::{LoreCategory, LoreEntry};
pub use message::{Dice, ImageInfo, Message, Role};
pub use npc::{LifecycleStatus, Npc, Personality};
pub use recap::Recap;
pub use snapshot::{AgentSnapshot, Snapshots};
pub use tag::{ParsedTag, TagFamily};

/// The id of the root branch. Reserved; never assigned to a forked branch.
pub const ROOT_BRANCH_ID: &str = "main";

/// Magic `branch_point_index` denoting a blank branch that inherits nothing
/// from its parent.
pub const BLANK_BRANCH_POINT: i64 = -1;
