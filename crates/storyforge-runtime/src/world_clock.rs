//! Per-branch monotonic day counter (§4.2), grounded on the original's
//! `world_timer.py`. `world_day.json` holds a single float; TIME tags
//! advance it, dungeon phase transitions charge fixed costs.

use serde::{Deserialize, Serialize};
use storyforge_core::{read_json_or_default, write_json_atomic, Workspace};
use storyforge_types::{BranchId, StoryId};

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
struct WorldDay(f64);

/// Fixed day costs for dungeon phase transitions (§4.2), matching the
/// original's `DUNGEON_TIME_COSTS`.
pub const DUNGEON_ENTER_COST: f64 = 3.0;
pub const DUNGEON_EXIT_COST: f64 = 1.0;
pub const DUNGEON_TRAINING_COST: f64 = 2.0;

pub fn get_world_day(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<f64> {
    let path = ws.branch(story, branch).world_day();
    let day: WorldDay = read_json_or_default(&path)?;
    Ok(day.0)
}

fn set_world_day(ws: &Workspace, story: &StoryId, branch: &BranchId, day: f64) -> Result<()> {
    let path = ws.branch(story, branch).world_day();
    write_json_atomic(&path, &WorldDay(day))?;
    Ok(())
}

/// Directly sets the clock, used when seeding a branch from a snapshot.
pub fn set(ws: &Workspace, story: &StoryId, branch: &BranchId, day: f64) -> Result<()> {
    set_world_day(ws, story, branch, day)
}

/// Advances the clock by `delta` days. Non-positive deltas are ignored
/// (§4.2: "ignores Δ≤0"), and the clock never decreases.
pub fn advance(ws: &Workspace, story: &StoryId, branch: &BranchId, delta: f64) -> Result<f64> {
    if delta <= 0.0 {
        return get_world_day(ws, story, branch);
    }
    let current = get_world_day(ws, story, branch)?;
    let next = current + delta;
    set_world_day(ws, story, branch, next)?;
    Ok(next)
}

/// Advances the clock by every parsed TIME-tag day count from one turn,
/// in order. Returns the resulting day.
pub fn apply_time_advances(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    advances: &[f64],
) -> Result<f64> {
    let mut day = get_world_day(ws, story, branch)?;
    for &delta in advances {
        if delta > 0.0 {
            day += delta;
            set_world_day(ws, story, branch, day)?;
        }
    }
    Ok(day)
}

/// Copies the parent's world day onto a freshly forked branch. A blank
/// branch resets to zero instead (Open Question 2 in DESIGN.md: the
/// original always resets blank branches, and the UI assumes that).
pub fn copy_parent_to_child(
    ws: &Workspace,
    story: &StoryId,
    parent: &BranchId,
    child: &BranchId,
    blank: bool,
) -> Result<()> {
    if blank {
        return set_world_day(ws, story, child, 0.0);
    }
    let day = get_world_day(ws, story, parent)?;
    // Mirrors the original's `copy_world_day`: only copies a day that has
    // actually advanced past zero, otherwise the child simply starts fresh.
    if day > 0.0 {
        set_world_day(ws, story, child, day)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DungeonPhaseTransition {
    Enter,
    Exit,
    Training,
}

impl DungeonPhaseTransition {
    fn cost(self) -> f64 {
        match self {
            Self::Enter => DUNGEON_ENTER_COST,
            Self::Exit => DUNGEON_EXIT_COST,
            Self::Training => DUNGEON_TRAINING_COST,
        }
    }
}

/// Charges the fixed day cost of a dungeon phase transition (§4.2).
pub fn advance_dungeon_phase(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    transition: DungeonPhaseTransition,
) -> Result<f64> {
    advance(ws, story, branch, transition.cost())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    #[test]
    fn fresh_branch_starts_at_zero() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        assert_eq!(get_world_day(&ws, &story, &branch).unwrap(), 0.0);
    }

    #[test]
    fn advance_ignores_non_positive_delta_and_never_decreases() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        advance(&ws, &story, &branch, 2.0).unwrap();
        advance(&ws, &story, &branch, -5.0).unwrap();
        advance(&ws, &story, &branch, 0.0).unwrap();
        assert_eq!(get_world_day(&ws, &story, &branch).unwrap(), 2.0);
    }

    #[test]
    fn dungeon_transitions_charge_fixed_costs() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        advance_dungeon_phase(&ws, &story, &branch, DungeonPhaseTransition::Enter).unwrap();
        advance_dungeon_phase(&ws, &story, &branch, DungeonPhaseTransition::Training).unwrap();
        advance_dungeon_phase(&ws, &story, &branch, DungeonPhaseTransition::Exit).unwrap();
        assert_eq!(get_world_day(&ws, &story, &branch).unwrap(), 6.0);
    }

    #[test]
    fn blank_branch_always_resets_regardless_of_parent_day() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let parent = BranchId::root();
        let child = BranchId::new("fork1");
        advance(&ws, &story, &parent, 10.0).unwrap();
        copy_parent_to_child(&ws, &story, &parent, &child, true).unwrap();
        assert_eq!(get_world_day(&ws, &story, &child).unwrap(), 0.0);
    }

    #[test]
    fn non_blank_fork_inherits_parent_day() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let parent = BranchId::root();
        let child = BranchId::new("fork1");
        advance(&ws, &story, &parent, 10.0).unwrap();
        copy_parent_to_child(&ws, &story, &parent, &child, false).unwrap();
        assert_eq!(get_world_day(&ws, &story, &child).unwrap(), 10.0);
    }

    #[test]
    fn time_advances_apply_in_order_and_skip_non_positive() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        let day = apply_time_advances(&ws, &story, &branch, &[1.5, 0.0, 2.0]).unwrap();
        assert_eq!(day, 3.5);
    }
}
