//! Fate-dice resolution: a d100 roll modified by the character's physique,
//! spirit and gene-lock attributes, plus whatever GM cheat is active on the
//! branch (see [`crate::cheats`]).

use rand::Rng;
use storyforge_types::{
    CharacterState, DiceResult, DiceTable, Outcome, GENE_LOCK_TABLE, PHYSIQUE_TABLE, SPIRIT_TABLE,
};

/// Strips parenthesized suffixes so a label table match isn't defeated by
/// an annotation: `"普通人類（稍強）"` → `"普通人類 稍強"`.
fn flatten_parens(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut depth = 0u32;
    for ch in raw.chars() {
        match ch {
            '（' | '(' => {
                depth += 1;
                out.push(' ');
            }
            '）' | ')' => {
                depth = depth.saturating_sub(1);
            }
            _ => out.push(ch),
        }
    }
    let _ = depth;
    out.trim().to_string()
}

/// Fuzzy-matches an attribute string against an ordered modifier table: the
/// first label that appears anywhere in the paren-flattened string wins.
fn lookup_modifier(raw: &str, table: DiceTable) -> i64 {
    if raw.is_empty() {
        return 0;
    }
    let flat = flatten_parens(raw);
    for (label, modifier) in table.0 {
        if flat.contains(label) {
            return *modifier;
        }
    }
    0
}

fn get_modifiers(state: &CharacterState) -> (i64, i64, i64) {
    let physique = lookup_modifier(state.string_field("physique"), PHYSIQUE_TABLE);
    let spirit = lookup_modifier(state.string_field("spirit"), SPIRIT_TABLE);
    let gene_lock = lookup_modifier(state.string_field("gene_lock"), GENE_LOCK_TABLE);
    (physique, spirit, gene_lock)
}

/// Rolls a d100 fate die against `state`'s attributes.
///
/// `cheat_modifier` comes from an active `/gm dice` override; `always_success`
/// collapses the outcome space to the three positive labels (30/50/20 split)
/// instead of the full six-way threshold ladder.
pub fn roll_fate(state: &CharacterState, cheat_modifier: i64, always_success: bool) -> DiceResult {
    let (p_mod, s_mod, g_mod) = get_modifiers(state);
    let attr_bonus = (p_mod + s_mod).div_euclid(2) + g_mod;

    let raw: u8 = rand::thread_rng().gen_range(1..=100);
    let effective = raw as i64 + attr_bonus + cheat_modifier;

    let outcome = if always_success {
        if raw >= 71 {
            Outcome::GreatSuccess
        } else if raw >= 21 {
            Outcome::Success
        } else {
            Outcome::NarrowSuccess
        }
    } else if raw >= 96 {
        Outcome::GreatSuccess
    } else if raw <= 5 {
        Outcome::GreatFailure
    } else if effective >= 80 {
        Outcome::Success
    } else if effective >= 50 {
        Outcome::NarrowSuccess
    } else if effective >= 30 {
        Outcome::Failure
    } else {
        Outcome::SevereFailure
    };

    DiceResult {
        raw,
        attr_bonus,
        physique_mod: p_mod,
        spirit_mod: s_mod,
        gene_lock_mod: g_mod,
        effective,
        outcome,
        cheat_modifier: if cheat_modifier != 0 {
            Some(cheat_modifier)
        } else {
            None
        },
        always_success: if always_success { Some(true) } else { None },
    }
}

/// Formats a dice result as the context block injected ahead of the GM turn.
/// The instruction to avoid mechanical vocabulary in the narrative is load
/// bearing: it's the only thing keeping the roll invisible to the player.
pub fn format_dice_context(result: &DiceResult) -> String {
    format!(
        "[命運判定]\n判定: **{}** — {}\n（此為系統內部判定，請融入敘事中體現結果好壞，\
但絕對不要在敘事中出現「命運骰」「判定結果」「骰面」等詞彙。\
若玩家的行動不涉及需要判定的情境，可忽略。）",
        result.outcome.as_str(),
        result.outcome.description()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with(physique: &str, spirit: &str, gene_lock: &str) -> CharacterState {
        let mut state = CharacterState::new();
        state.set("physique", json!(physique));
        state.set("spirit", json!(spirit));
        state.set("gene_lock", json!(gene_lock));
        state
    }

    #[test]
    fn lookup_modifier_matches_paren_annotated_label() {
        let modifier = lookup_modifier("普通人類（稍強）", PHYSIQUE_TABLE);
        assert_eq!(modifier, 1);
    }

    #[test]
    fn lookup_modifier_falls_back_to_zero_for_unknown_label() {
        assert_eq!(lookup_modifier("未知屬性", PHYSIQUE_TABLE), 0);
        assert_eq!(lookup_modifier("", PHYSIQUE_TABLE), 0);
    }

    #[test]
    fn attr_bonus_combines_all_three_tables() {
        let state = state_with("強化人類", "強大", "第二階");
        let (p, s, g) = get_modifiers(&state);
        assert_eq!((p, s, g), (3, 5, 10));
    }

    #[test]
    fn roll_fate_records_cheat_modifier_only_when_nonzero() {
        let state = CharacterState::new();
        let result = roll_fate(&state, 0, false);
        assert!(result.cheat_modifier.is_none());
        let result = roll_fate(&state, 15, false);
        assert_eq!(result.cheat_modifier, Some(15));
    }

    #[test]
    fn roll_fate_always_success_never_yields_failure_outcomes() {
        let state = CharacterState::new();
        for _ in 0..200 {
            let result = roll_fate(&state, 0, true);
            assert!(matches!(
                result.outcome,
                Outcome::GreatSuccess | Outcome::Success | Outcome::NarrowSuccess
            ));
            assert_eq!(result.always_success, Some(true));
        }
    }

    #[test]
    fn format_dice_context_never_leaks_mechanical_vocabulary_as_instruction() {
        let state = CharacterState::new();
        let result = roll_fate(&state, 0, false);
        let text = format_dice_context(&result);
        assert!(text.contains("[命運判定]"));
        assert!(text.contains(result.outcome.as_str()));
    }
}
