use crate::BranchId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Planted,
    Triggered,
    Resolved,
    Abandoned,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Planted => "planted",
            EventStatus::Triggered => "triggered",
            EventStatus::Resolved => "resolved",
            EventStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EventStatus::Planted | EventStatus::Triggered)
    }
}

/// `{id, event_type, title, description, status, tags, related_titles,
/// message_index, branch_id, created_at}` — title is unique per branch (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub event_type: String,
    pub title: String,
    pub description: String,
    pub status: EventStatus,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub related_titles: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index: Option<i64>,
    pub branch_id: BranchId,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
