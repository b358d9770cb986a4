use crate::BranchId;
use crate::snapshot::Snapshots;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Gm,
}

/// A fate-dice roll attached to a user message (see [`crate::dice`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dice {
    pub raw: u8,
    pub attr_bonus: i64,
    pub physique_mod: i64,
    pub spirit_mod: i64,
    pub gene_lock_mod: i64,
    pub effective: i64,
    pub outcome: crate::dice::Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cheat_modifier: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub always_success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// One message in a branch's delta or in a reconstructed timeline.
///
/// `owner_branch_id` is never persisted to disk — the branch engine
/// stamps it on at read time while walking the ancestor chain (spec
/// Open Question 1: kept derive-at-read-time to preserve promotion
/// invariants).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub index: i64,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dice: Option<Dice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInfo>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<Snapshots>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_branch_id: Option<BranchId>,
}

impl Message {
    pub fn user(index: i64, content: impl Into<String>) -> Self {
        Self {
            index,
            role: Role::User,
            content: content.into(),
            dice: None,
            image: None,
            snapshots: None,
            owner_branch_id: None,
        }
    }

    pub fn gm(index: i64, content: impl Into<String>) -> Self {
        Self {
            index,
            role: Role::Gm,
            content: content.into(),
            dice: None,
            image: None,
            snapshots: None,
            owner_branch_id: None,
        }
    }

    /// Strips transient/read-time-only fields before a message is written
    /// into another branch's delta (promote, merge). Mirrors the original's
    /// `m.pop("owner_branch_id", None); m.pop("inherited", None)`.
    pub fn clear_transient(&mut self) {
        self.owner_branch_id = None;
    }
}
