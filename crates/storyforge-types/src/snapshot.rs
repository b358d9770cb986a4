use crate::{CharacterState, Npc};
use serde::{Deserialize, Serialize};

/// The three fields every GM message carries, captured *after* that turn's
/// side-effects apply (§3, invariant 4). `#[serde(flatten)]`-ed onto
/// [`crate::Message`] so they round-trip as top-level JSON keys on disk,
/// matching the original's flat message dict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshots {
    pub state_snapshot: CharacterState,
    pub npcs_snapshot: Vec<Npc>,
    pub world_day_snapshot: f64,
}

/// One entry in a branch's `agent_snapshots.json`, used for cross-agent /
/// time-travel reads keyed by world day (§4.12).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub world_day: f64,
    pub turn: u64,
    #[serde(default)]
    pub phase: String,
    pub character_state: CharacterState,
    #[serde(default)]
    pub completed_missions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
