use serde::{Deserialize, Serialize};

/// Rolling narrative compaction state for a branch (§3, §4.6).
/// `compacted_through_index` never exceeds `timeline_len - RECENT_WINDOW`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recap {
    pub compacted_through_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compacted_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub recap_text: String,
    #[serde(default)]
    pub total_turns_compacted: u64,
}

impl Default for Recap {
    fn default() -> Self {
        Self {
            compacted_through_index: -1,
            last_compacted_at: None,
            recap_text: String::new(),
            total_turns_compacted: 0,
        }
    }
}

pub const RECAP_FALLBACK_TEXT: &str = "（尚無回顧，完整對話記錄已提供。）";

impl Recap {
    /// Text for system-prompt injection, or the fallback placeholder.
    pub fn display_text(&self) -> &str {
        let trimmed = self.recap_text.trim();
        if trimmed.is_empty() {
            RECAP_FALLBACK_TEXT
        } else {
            trimmed
        }
    }
}
