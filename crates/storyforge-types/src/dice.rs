use serde::{Deserialize, Serialize};

pub use crate::message::Dice as DiceResult;

/// Fate-dice outcome labels (§4.9). Ordering matches narrative severity,
/// not numeric value — outcomes are computed by threshold, not derived
/// from this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "大成功")]
    GreatSuccess,
    #[serde(rename = "成功")]
    Success,
    #[serde(rename = "勉強成功")]
    NarrowSuccess,
    #[serde(rename = "失敗")]
    Failure,
    #[serde(rename = "大失敗")]
    GreatFailure,
    #[serde(rename = "嚴重失敗")]
    SevereFailure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::GreatSuccess => "大成功",
            Outcome::Success => "成功",
            Outcome::NarrowSuccess => "勉強成功",
            Outcome::Failure => "失敗",
            Outcome::GreatFailure => "大失敗",
            Outcome::SevereFailure => "嚴重失敗",
        }
    }

    /// Narrative framing line shown alongside the outcome label
    /// (`dice._OUTCOMES`).
    pub fn description(&self) -> &'static str {
        match self {
            Outcome::GreatSuccess => "命運眷顧，超乎預期的完美結果",
            Outcome::Success => "順利達成目標",
            Outcome::NarrowSuccess => "險些失敗，但勉強達成，可能有代價或不完美",
            Outcome::Failure => "未能達成目標，可能遭受挫折",
            Outcome::GreatFailure => "災難性的失敗，情況急轉直下",
            Outcome::SevereFailure => "未能達成目標，並帶來額外的負面後果",
        }
    }
}

/// A fuzzy attribute-level → integer-modifier lookup table. Rows are
/// checked in order; the first label that appears as a substring of the
/// (paren-flattened) attribute string wins. Mirrors `dice._lookup_modifier`.
#[derive(Debug, Clone)]
pub struct DiceTable(pub &'static [(&'static str, i64)]);

pub const PHYSIQUE_TABLE: DiceTable = DiceTable(&[
    ("超級戰士", 10),
    ("強化人類", 3),
    ("稍強", 1),
    ("普通", 0),
]);

pub const SPIRIT_TABLE: DiceTable = DiceTable(&[
    ("超強", 10),
    ("強大", 5),
    ("偏高", 1),
    ("中等偏上", 1),
    ("普通", 0),
]);

pub const GENE_LOCK_TABLE: DiceTable = DiceTable(&[
    ("第四階", 30),
    ("第三階", 20),
    ("第二階", 10),
    ("第一階", 5),
    ("未開啟", 0),
]);
