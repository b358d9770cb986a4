use crate::{BranchId, BLANK_BRANCH_POINT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A node in a story's branch tree (§3). `main` is the reserved root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<BranchId>,
    /// `None` only on root. `-1` denotes a blank branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_point_index: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blank: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Set when this branch was retired as a former `main` by a promotion,
    /// rather than hard-deleted (§4.11 Delete).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub was_main: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Branch {
    pub fn root(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id: BranchId::root(),
            name: "主線".to_string(),
            parent_branch_id: None,
            branch_point_index: None,
            created_at: now,
            session_id: None,
            blank: false,
            deleted: false,
            deleted_at: None,
            was_main: false,
            merged: false,
            merged_at: None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.blank || self.branch_point_index == Some(BLANK_BRANCH_POINT)
    }

    /// Active means: not soft-deleted, not merged away. Matches the
    /// original's filter for `/api/branches` listing.
    pub fn is_active_listable(&self) -> bool {
        !self.deleted && !self.merged
    }

    pub fn is_writable(&self) -> bool {
        !self.deleted && !self.merged
    }
}

const DEFAULT_TEAM_MODE: &str = "free_agent";

/// A branch's free-form settings (`config.json`, §6). Untyped beyond the
/// one key every branch reads (`team_mode`) - new settings can be added
/// without a migration, the same stance as [`crate::CharacterState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchConfig(pub Map<String, Value>);

impl BranchConfig {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn team_mode(&self) -> &str {
        self.0
            .get("team_mode")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TEAM_MODE)
    }

    /// Merges `patch`'s keys into this config, overwriting on conflict -
    /// matches the original's `config.update(body)`.
    pub fn merge(&mut self, patch: Map<String, Value>) {
        for (k, v) in patch {
            self.0.insert(k, v);
        }
    }
}

/// Per-story registry of branches plus which one is currently active.
/// Persisted as `timeline_tree.json` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchTree {
    pub active_branch_id: BranchId,
    pub branches: BTreeMap<String, Branch>,
}

impl BranchTree {
    pub fn new(root: Branch) -> Self {
        let mut branches = BTreeMap::new();
        branches.insert(root.id.as_str().to_string(), root.clone());
        Self {
            active_branch_id: root.id,
            branches,
        }
    }

    pub fn get(&self, id: &BranchId) -> Option<&Branch> {
        self.branches.get(id.as_str())
    }

    pub fn get_mut(&mut self, id: &BranchId) -> Option<&mut Branch> {
        self.branches.get_mut(id.as_str())
    }

    pub fn insert(&mut self, branch: Branch) {
        self.branches.insert(branch.id.as_str().to_string(), branch);
    }

    pub fn contains(&self, id: &BranchId) -> bool {
        self.branches.contains_key(id.as_str())
    }

    /// Branches visible through the public listing API: not soft-deleted,
    /// not merged away.
    pub fn listable(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values().filter(|b| b.is_active_listable())
    }

    /// Ancestor chain from root to `branch_id` inclusive, root first.
    pub fn ancestor_chain(&self, branch_id: &BranchId) -> Vec<Branch> {
        let mut chain = Vec::new();
        let mut cur = Some(branch_id.clone());
        while let Some(id) = cur {
            let Some(branch) = self.branches.get(id.as_str()) else {
                break;
            };
            chain.push(branch.clone());
            cur = branch.parent_branch_id.clone();
        }
        chain.reverse();
        chain
    }

    /// Set of ids on the ancestor path of `branch_id`, including itself.
    pub fn ancestor_ids(&self, branch_id: &BranchId) -> Vec<BranchId> {
        self.ancestor_chain(branch_id)
            .into_iter()
            .map(|b| b.id)
            .collect()
    }
}
