//! Assembles what actually goes to the LLM: the system prompt (character
//! sheet + recap + lore TOC + NPC roster + team rules) and the augmented
//! user message (retrieved lore/events/NPC-activity/dice context glued
//! ahead of what the player typed), grounded on the original's
//! `_build_story_system_prompt`/`_build_augmented_message` (§4.8).

use once_cell::sync::Lazy;
use regex::Regex;
use storyforge_core::Workspace;
use storyforge_engine::dice::{self, DiceResult};
use storyforge_index::state::{SearchContext, SearchOptions, StateIndex};
use storyforge_index::{EventIndex, LoreIndex};
use storyforge_types::{BranchConfig, CharacterState, Message, Npc, Role, StoryId};

use crate::error::Result;

const FREE_AGENT_RULES: &str = "4. **組隊系統**：主神以「個人」為單位分配任務，每次從輪迴者中挑選 20-30 人投放進同一副本。\
進入副本後自行結盟、組隊、分工，任務結束各自回主神空間，下次重新分配。\
每次副本的隊友組合都不同——你可能遇到老戰友、排行榜大佬、甚至死對頭。\
信任建立是生存核心：這人可信嗎？合作還是防備？";

const FIXED_TEAM_RULES: &str = "4. **團隊系統**：新人混合隊（20人）存活者可組成固定隊伍（最多8人），\
之後每次任務整隊一起進副本。有人死了可招募補位，低於4人主神強制塞人。\
固定隊伍間偶爾會被安排進同一副本，形成合作或對抗局面。";

fn team_rules_for(team_mode: &str) -> &'static str {
    match team_mode {
        "fixed_team" => FIXED_TEAM_RULES,
        _ => FREE_AGENT_RULES,
    }
}

const NO_RECAP_FALLBACK: &str = "（尚無回顧，完整對話記錄已提供。）";
const NO_NPCS_FALLBACK: &str = "（尚無已記錄的 NPC）";
const NO_OTHER_AGENTS_FALLBACK: &str = "（目前無其他輪迴者資料）";
const NO_CRITICAL_FACTS_FALLBACK: &str = "（無）";

/// Builds the NPC-profile block injected as `{npc_profiles}`.
pub fn build_npc_text(npcs: &[Npc]) -> String {
    if npcs.is_empty() {
        return NO_NPCS_FALLBACK.to_string();
    }
    let mut lines = Vec::new();
    for npc in npcs {
        let role = if npc.role.is_empty() { "?" } else { &npc.role };
        lines.push(format!("### {}（{role}）", npc.name));
        if !npc.appearance.is_empty() {
            lines.push(format!("- 外觀：{}", npc.appearance));
        }
        if !npc.personality.summary.is_empty() {
            lines.push(format!("- 性格：{}", npc.personality.summary));
        }
        let relationship = npc.relationship_to_player.as_display();
        if !relationship.is_empty() {
            lines.push(format!("- 與主角關係：{relationship}"));
        }
        if !npc.current_status.is_empty() {
            lines.push(format!("- 狀態：{}", npc.current_status));
        }
        if !npc.notable_traits.is_empty() {
            lines.push(format!("- 特質：{}", npc.notable_traits.join("、")));
        }
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

/// Builds the `{world_lore}` block: the lore table of contents, prefixed
/// with an explanatory line when any entries exist (full content arrives
/// per-turn via [`LoreIndex::relevant_lore_block`] instead).
pub fn build_lore_text(lore: &LoreIndex) -> Result<String> {
    let toc = lore.table_of_contents()?;
    if toc == "（尚無已確立的世界設定）" {
        return Ok(toc);
    }
    Ok(format!(
        "以下為世界設定目錄（完整內容會在每次對話中根據相關性自動附加）：\n\n{toc}"
    ))
}

/// Fills a system-prompt template's placeholders. `story_summary` should
/// already be blanked by the caller for blank branches (§4.8: "A blank
/// branch always gets an empty summary").
#[allow(clippy::too_many_arguments)]
pub fn fill_system_prompt(
    template: &str,
    character_state_text: &str,
    story_summary: &str,
    world_lore: &str,
    npc_profiles: &str,
    team_rules: &str,
    narrative_recap: &str,
    other_agents: &str,
    critical_facts: &str,
) -> String {
    let narrative_recap = if narrative_recap.is_empty() {
        NO_RECAP_FALLBACK
    } else {
        narrative_recap
    };
    template
        .replace("{character_state}", character_state_text)
        .replace("{story_summary}", story_summary)
        .replace("{world_lore}", world_lore)
        .replace("{npc_profiles}", npc_profiles)
        .replace("{team_rules}", team_rules)
        .replace("{narrative_recap}", narrative_recap)
        .replace("{other_agents}", other_agents)
        .replace("{critical_facts}", critical_facts)
}

/// Full system-prompt assembly: reads the story's template off disk, pulls
/// the lore TOC and NPC roster, and fills every placeholder.
pub fn build_system_prompt(
    ws: &Workspace,
    story: &StoryId,
    state: &CharacterState,
    story_summary: &str,
    lore: &LoreIndex,
    npcs: &[Npc],
    branch_config: &BranchConfig,
    narrative_recap: &str,
    blank_branch: bool,
    other_agents: Option<&str>,
    critical_facts: Option<&str>,
) -> Result<String> {
    let template_path = ws.story_design(story).system_prompt();
    let template = std::fs::read_to_string(&template_path).unwrap_or_default();
    let state_text = serde_json::to_string_pretty(&state.0).unwrap_or_default();
    let lore_text = build_lore_text(lore)?;
    let npc_text = build_npc_text(npcs);
    let team_rules = team_rules_for(branch_config.team_mode());
    let summary = if blank_branch { "" } else { story_summary };

    Ok(fill_system_prompt(
        &template,
        &state_text,
        summary,
        &lore_text,
        &npc_text,
        team_rules,
        narrative_recap,
        other_agents.unwrap_or(NO_OTHER_AGENTS_FALLBACK),
        critical_facts.unwrap_or(NO_CRITICAL_FACTS_FALLBACK),
    ))
}

/// Result of assembling the augmented user message: the text actually sent
/// to the LLM, plus the dice roll (if any) so the turn pipeline can label
/// the eventual GM message with it.
pub struct AugmentedMessage {
    pub text: String,
    pub dice: Option<DiceResult>,
}

/// Builds `retrieved_blocks + "\n---\n" + user_text` (§4.8). `state` is
/// `None` when there is no character sheet yet to roll dice against (e.g.
/// character creation turns); `activities` is the caller-supplied recent
/// NPC-activity text (see [`crate::npc_evolution::get_recent_activities`]).
#[allow(clippy::too_many_arguments)]
pub fn build_augmented_message(
    lore: &LoreIndex,
    events: &EventIndex,
    state_index: Option<&StateIndex>,
    branch: &storyforge_types::BranchId,
    user_text: &str,
    state: Option<&CharacterState>,
    cheat_modifier: i64,
    always_success: bool,
    activities: &str,
    blank_branch: bool,
    phase: &str,
) -> Result<AugmentedMessage> {
    let mut parts = Vec::new();

    let lore_block = lore.relevant_lore_block(user_text, 5)?;
    if !lore_block.is_empty() {
        parts.push(lore_block);
    }

    if !blank_branch {
        let events_block = events.relevant_events_block(user_text, branch, 3)?;
        if !events_block.is_empty() {
            parts.push(events_block);
        }
    }

    if let Some(index) = state_index {
        let status = state.map(|s| s.string_field("current_status").to_string()).unwrap_or_default();
        let options = SearchOptions {
            max_items: Some(8),
            context: Some(SearchContext { phase: phase.to_string(), status }),
            ..Default::default()
        };
        let state_block = index.search(user_text, &options)?;
        if !state_block.is_empty() {
            parts.push(state_block);
        }
    }

    if !activities.is_empty() {
        parts.push(activities.to_string());
    }

    let dice = state.map(|s| dice::roll_fate(s, cheat_modifier, always_success));
    if let Some(result) = &dice {
        parts.push(dice::format_dice_context(result));
    }

    let text = if parts.is_empty() {
        user_text.to_string()
    } else {
        format!("{}\n---\n{}", parts.join("\n"), user_text)
    };

    Ok(AugmentedMessage { text, dice })
}

static FATE_DICE_LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\*{0,2}(?:\[命運[^\[\]\r\n]*?[:：][^\[\]\r\n]*?\]|【命運[^【】\r\n]*?[:：][^【】\r\n]*?】)\*{0,2}")
        .expect("fate dice label regex is valid")
});

fn strip_fate_dice_labels(content: &str) -> String {
    FATE_DICE_LABEL_RE.replace_all(content, "").trim().to_string()
}

fn strip_optional_actions(content: &str) -> String {
    for marker in ["可選行動:", "可選行動："] {
        if let Some(idx) = content.find(marker) {
            return content[..idx].trim_end().to_string();
        }
    }
    content.to_string()
}

/// Sanitizes the recent-window messages sent to the LLM: strips fate-dice
/// result labels and trailing "可選行動:" blocks from GM messages only
/// (§4.8). User messages pass through unmodified.
pub fn sanitize_recent_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| {
            if m.role != Role::Gm {
                return m.clone();
            }
            let mut cleaned = m.clone();
            cleaned.content = strip_optional_actions(&strip_fate_dice_labels(&m.content));
            cleaned
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_types::npc::RelationshipValue;
    use storyforge_types::Personality;

    #[test]
    fn npc_text_falls_back_when_empty() {
        assert_eq!(build_npc_text(&[]), NO_NPCS_FALLBACK);
    }

    #[test]
    fn npc_text_includes_populated_fields_only() {
        let npc = Npc {
            name: "艾莉絲".to_string(),
            role: "嚮導".to_string(),
            appearance: "銀髮紫瞳".to_string(),
            personality: Personality {
                summary: "謹慎但忠誠".to_string(),
                ..Default::default()
            },
            relationship_to_player: RelationshipValue::Text("盟友".to_string()),
            current_status: "健康".to_string(),
            notable_traits: vec!["夜視".to_string(), "劍術".to_string()],
            ..Default::default()
        };
        let text = build_npc_text(&[npc]);
        assert!(text.contains("### 艾莉絲（嚮導）"));
        assert!(text.contains("外觀：銀髮紫瞳"));
        assert!(text.contains("特質：夜視、劍術"));
    }

    #[test]
    fn team_rules_select_by_mode() {
        assert_eq!(team_rules_for("fixed_team"), FIXED_TEAM_RULES);
        assert_eq!(team_rules_for("free_agent"), FREE_AGENT_RULES);
        assert_eq!(team_rules_for("unknown"), FREE_AGENT_RULES);
    }

    #[test]
    fn fill_system_prompt_replaces_every_placeholder() {
        let template = "狀態:{character_state}\n摘要:{story_summary}\n世界:{world_lore}\n\
NPC:{npc_profiles}\n隊伍:{team_rules}\n回顧:{narrative_recap}\n其他:{other_agents}\n事實:{critical_facts}";
        let text = fill_system_prompt(
            template, "{}", "摘要文字", "世界設定", "NPC文字", "隊伍規則", "", "其他玩家", "事實",
        );
        assert!(text.contains("回顧:（尚無回顧，完整對話記錄已提供。）"));
        assert!(!text.contains('{'));
    }

    #[test]
    fn sanitize_strips_fate_dice_labels_from_gm_messages_only() {
        let messages = vec![
            Message::user(0, "[命運判定:成功] 我試試看".to_string()),
            Message::gm(1, "你揮劍砍向敵人。[命運判定:大成功] 敵人應聲倒地。".to_string()),
        ];
        let cleaned = sanitize_recent_messages(&messages);
        assert_eq!(cleaned[0].content, "[命運判定:成功] 我試試看");
        assert!(!cleaned[1].content.contains("命運判定"));
        assert!(cleaned[1].content.contains("你揮劍砍向敵人。"));
    }

    #[test]
    fn sanitize_strips_trailing_optional_actions_block() {
        let messages = vec![Message::gm(
            0,
            "故事繼續發展。\n可選行動:\n1. 前進\n2. 撤退".to_string(),
        )];
        let cleaned = sanitize_recent_messages(&messages);
        assert_eq!(cleaned[0].content, "故事繼續發展。");
    }

    #[test]
    fn augmented_message_includes_a_state_index_block_when_present() {
        let lore = LoreIndex::open_in_memory().unwrap();
        let events = EventIndex::open_in_memory().unwrap();
        let index = StateIndex::open_in_memory().unwrap();
        let mut state = CharacterState::new();
        state.set("inventory", serde_json::json!(["回復藥水 x3"]));
        index.rebuild_from_json(&state, &[]).unwrap();

        let branch = storyforge_types::BranchId::root();
        let augmented = build_augmented_message(
            &lore,
            &events,
            Some(&index),
            &branch,
            "我查看藥水",
            Some(&state),
            0,
            false,
            "",
            true,
            "hub",
        )
        .unwrap();
        assert!(augmented.text.contains("藥水"));
    }

    #[test]
    fn augmented_message_omits_state_block_when_index_absent() {
        let lore = LoreIndex::open_in_memory().unwrap();
        let events = EventIndex::open_in_memory().unwrap();
        let branch = storyforge_types::BranchId::root();
        let augmented = build_augmented_message(&lore, &events, None, &branch, "我前進", None, 0, false, "", true, "hub").unwrap();
        assert_eq!(augmented.text, "我前進");
    }
}
