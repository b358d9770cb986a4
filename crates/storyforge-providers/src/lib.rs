//! Trait contracts between the narrative core and its LLM/telemetry
//! collaborators. Per spec §1, concrete provider adapters (streaming +
//! one-shot chat, web-grounded search), image generation, and usage/trace
//! logging are out of scope — this crate only defines the seams
//! `storyforge-runtime` calls through.

pub mod error;
pub mod traits;
pub mod usage;

pub use error::{ProviderError, Result};
pub use traits::{ERROR_MARKER, GmReply, GmRequest, LlmProvider, StreamEvent, is_provider_error};
pub use usage::{NullUsageSink, UsageRecord, UsageSink, call_type};
