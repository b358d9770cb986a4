//! Usage/token-tracking sink contract (§6, `usage.db`). The core logs every
//! LLM call it makes; where those logs end up is an external collaborator's
//! decision, same as the provider adapters themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use storyforge_types::{BranchId, StoryId};

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub call_type: String,
    pub prompt_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub branch_id: BranchId,
    pub elapsed_ms: Option<i64>,
}

/// Call-type tags used throughout the background workers and turn
/// pipeline, matching `usage_db.log_usage(call_type=...)` call sites.
pub mod call_type {
    pub const GM_TURN: &str = "gm_turn";
    pub const COMPACTION: &str = "compaction";
    pub const NPC_EVOLUTION: &str = "npc_evolution";
    pub const STRUCTURED_EXTRACTION: &str = "structured_extraction";
    pub const SNAPSHOT_SUMMARY: &str = "snapshot_summary";
    pub const STATE_NORMALIZATION: &str = "state_normalization";
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn log(&self, story: &StoryId, record: UsageRecord);
}

/// Discards every record. The default sink for embedders that don't care
/// about token accounting.
pub struct NullUsageSink;

#[async_trait]
impl UsageSink for NullUsageSink {
    async fn log(&self, _story: &StoryId, _record: UsageRecord) {}
}
