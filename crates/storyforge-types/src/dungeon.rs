use serde::{Deserialize, Serialize};

/// A branch's current hub/dungeon phase (§3, §4.5's context-boost signal).
/// Persisted per branch so the C5 state index can weight retrieval toward
/// inventory/missions while in the hub and toward NPCs/abilities mid-dungeon,
/// without re-deriving the phase from scratch on every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DungeonProgress {
    #[serde(default = "default_phase")]
    pub phase: String,
    #[serde(default)]
    pub dungeon_depth: i64,
    #[serde(default)]
    pub entered_at_day: f64,
}

fn default_phase() -> String {
    "hub".to_string()
}

impl Default for DungeonProgress {
    fn default() -> Self {
        Self {
            phase: default_phase(),
            dungeon_depth: 0,
            entered_at_day: 0.0,
        }
    }
}
