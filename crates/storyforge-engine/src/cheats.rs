//! `/gm` commands and per-branch cheat storage. Only a dice-modifier cheat
//! exists today; `GmCheats` is a plain JSON map so new cheat kinds can be
//! added without a migration.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use storyforge_core::{read_json_or_default, write_json_atomic, Result, Workspace};
use storyforge_types::{BranchId, StoryId};

static DICE_CMD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^/gm\s+(?:dice|骰子)\s*([+-]\d+|reset|重置)").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiceCommandAction {
    Add,
    Subtract,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiceCommandResult {
    pub old: i64,
    pub new: i64,
    pub action: DiceCommandAction,
}

/// A branch's GM cheat state. `#[serde(flatten)]` lets unrecognized keys
/// round-trip untouched, the same forward-compatibility stance the rest of
/// the state files take.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GmCheats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dice_modifier: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GmCheats {
    pub fn dice_modifier(&self) -> i64 {
        self.dice_modifier.unwrap_or(0)
    }
}

pub fn load_cheats(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<GmCheats> {
    read_json_or_default(&ws.branch(story, branch).gm_cheats())
}

pub fn save_cheats(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    cheats: &GmCheats,
) -> Result<()> {
    write_json_atomic(&ws.branch(story, branch).gm_cheats(), cheats)
}

/// Copies a branch's cheats onto a freshly created branch, on fork/regen.
pub fn copy_cheats(
    ws: &Workspace,
    story: &StoryId,
    src: &BranchId,
    dst: &BranchId,
) -> Result<()> {
    let path = ws.branch(story, src).gm_cheats();
    if path.exists() {
        let cheats: GmCheats = read_json_or_default(&path)?;
        save_cheats(ws, story, dst, &cheats)?;
    }
    Ok(())
}

pub fn get_dice_modifier(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<i64> {
    Ok(load_cheats(ws, story, branch)?.dice_modifier())
}

pub fn is_gm_command(text: &str) -> bool {
    text.trim().starts_with("/gm")
}

/// Parses a `/gm dice ...` command into the modifier value it sets (`0` for
/// reset). `None` if `text` isn't a dice command at all.
pub fn parse_dice_command(text: &str) -> Option<i64> {
    let caps = DICE_CMD_RE.captures(text.trim())?;
    let val = caps.get(1)?.as_str();
    if val == "reset" || val == "重置" {
        Some(0)
    } else {
        val.parse::<i64>().ok()
    }
}

/// Parses and applies a `/gm dice` command against the branch's stored
/// cheats, persisting the new modifier. Returns `None` if `text` wasn't a
/// dice command.
pub fn apply_dice_command(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    text: &str,
) -> Result<Option<DiceCommandResult>> {
    let Some(new_mod) = parse_dice_command(text) else {
        return Ok(None);
    };

    let mut cheats = load_cheats(ws, story, branch)?;
    let old_mod = cheats.dice_modifier();
    cheats.dice_modifier = Some(new_mod);
    save_cheats(ws, story, branch, &cheats)?;

    let action = if new_mod == 0 {
        DiceCommandAction::Reset
    } else if new_mod > 0 {
        DiceCommandAction::Add
    } else {
        DiceCommandAction::Subtract
    };
    Ok(Some(DiceCommandResult {
        old: old_mod,
        new: new_mod,
        action,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::Workspace;

    fn ws() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    #[test]
    fn is_gm_command_checks_prefix_only() {
        assert!(is_gm_command("/gm dice +10"));
        assert!(is_gm_command("  /gm 骰子 reset"));
        assert!(!is_gm_command("我想 /gm dice"));
    }

    #[test]
    fn parse_dice_command_handles_sign_reset_and_garbage() {
        assert_eq!(parse_dice_command("/gm dice +30"), Some(30));
        assert_eq!(parse_dice_command("/gm dice -10"), Some(-10));
        assert_eq!(parse_dice_command("/gm 骰子 reset"), Some(0));
        assert_eq!(parse_dice_command("/gm 骰子 重置"), Some(0));
        assert_eq!(parse_dice_command("hello world"), None);
    }

    #[test]
    fn apply_dice_command_persists_and_reports_action() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let branch = BranchId::root();

        let result = apply_dice_command(&ws, &story, &branch, "/gm dice +20")
            .unwrap()
            .unwrap();
        assert_eq!(result, DiceCommandResult { old: 0, new: 20, action: DiceCommandAction::Add });
        assert_eq!(get_dice_modifier(&ws, &story, &branch).unwrap(), 20);

        let result = apply_dice_command(&ws, &story, &branch, "/gm dice reset")
            .unwrap()
            .unwrap();
        assert_eq!(result.old, 20);
        assert_eq!(result.new, 0);
        assert_eq!(result.action, DiceCommandAction::Reset);
    }

    #[test]
    fn apply_dice_command_returns_none_for_non_dice_text() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        assert!(apply_dice_command(&ws, &story, &branch, "just a normal message")
            .unwrap()
            .is_none());
    }

    #[test]
    fn copy_cheats_duplicates_onto_new_branch() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let src = BranchId::root();
        let dst = BranchId::new("branch_deadbeef");

        apply_dice_command(&ws, &story, &src, "/gm dice +5").unwrap();
        copy_cheats(&ws, &story, &src, &dst).unwrap();
        assert_eq!(get_dice_modifier(&ws, &story, &dst).unwrap(), 5);
    }
}
