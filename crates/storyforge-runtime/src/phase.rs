//! Persists each branch's hub/dungeon phase (§3, §4.5) so the C5 state
//! index's context boost survives across turns instead of being re-guessed
//! from scratch by whichever caller happens to be watching the transcript.
//! The detection regexes are grounded on the original's phase-transition
//! patterns; `storyforge-cli`'s auto-play loop tracks its own run-local
//! `Phase` for stop conditions and nudge prompts, but the persisted record
//! here is what actually feeds retrieval.

use once_cell::sync::Lazy;
use regex::Regex;
use storyforge_core::{read_json_or_default, write_json_atomic, Workspace};
use storyforge_types::{BranchId, DungeonProgress, StoryId};

use crate::error::Result;

static DUNGEON_START_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)【主神提示：.*?任務】|傳送開始|副本.*?開啟|進入副本|主神.*?傳送|白光.*?吞噬|場景.*?轉換").unwrap()
});
static DUNGEON_END_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)任務完成|返回主神空間|任務評級|副本.*?結束|回到.*?主神空間|傳送回.*?主神|主神.*?評分").unwrap()
});
static HUB_PATTERNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)兌換大廳|主神空間|訓練場|休息區|商城").unwrap());

pub fn load_dungeon_progress(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<DungeonProgress> {
    Ok(read_json_or_default(&ws.branch(story, branch).dungeon_progress())?)
}

fn save_dungeon_progress(ws: &Workspace, story: &StoryId, branch: &BranchId, progress: &DungeonProgress) -> Result<()> {
    write_json_atomic(&ws.branch(story, branch).dungeon_progress(), progress)?;
    Ok(())
}

/// Re-evaluates a branch's phase against the GM's latest reply and persists
/// any transition. `world_day` is stamped as `entered_at_day` only on a
/// hub -> dungeon transition, matching the original's dungeon-entry timer.
pub fn update_dungeon_progress(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    gm_text: &str,
    world_day: f64,
) -> Result<DungeonProgress> {
    let mut progress = load_dungeon_progress(ws, story, branch)?;
    let dungeon_start = DUNGEON_START_PATTERNS.is_match(gm_text);
    let dungeon_end = DUNGEON_END_PATTERNS.is_match(gm_text);
    let hub_detected = HUB_PATTERNS.is_match(gm_text);

    match progress.phase.as_str() {
        "dungeon" => {
            if dungeon_end || (hub_detected && !dungeon_start) {
                progress.phase = "hub".to_string();
            }
        }
        _ => {
            if dungeon_start {
                progress.phase = "dungeon".to_string();
                progress.dungeon_depth += 1;
                progress.entered_at_day = world_day;
            }
        }
    }

    save_dungeon_progress(ws, story, branch, &progress)?;
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hub_to_dungeon_bumps_depth_and_stamps_entry_day() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        std::fs::create_dir_all(ws.branch(&story, &branch).dir()).unwrap();

        let progress = update_dungeon_progress(&ws, &story, &branch, "白光瞬間吞噬了你的視野", 3.5).unwrap();
        assert_eq!(progress.phase, "dungeon");
        assert_eq!(progress.dungeon_depth, 1);
        assert_eq!(progress.entered_at_day, 3.5);
    }

    #[test]
    fn dungeon_to_hub_on_completion_text() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        std::fs::create_dir_all(ws.branch(&story, &branch).dir()).unwrap();
        update_dungeon_progress(&ws, &story, &branch, "進入副本", 1.0).unwrap();

        let progress = update_dungeon_progress(&ws, &story, &branch, "任務完成，你被傳送回主神空間", 2.0).unwrap();
        assert_eq!(progress.phase, "hub");
        assert_eq!(progress.dungeon_depth, 1);
    }

    #[test]
    fn hub_keywords_mid_dungeon_start_do_not_override() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let story = StoryId::new("s1");
        let branch = BranchId::root();
        std::fs::create_dir_all(ws.branch(&story, &branch).dir()).unwrap();

        let progress = update_dungeon_progress(&ws, &story, &branch, "進入副本，眼前是一座訓練場", 1.0).unwrap();
        assert_eq!(progress.phase, "dungeon");
    }
}
