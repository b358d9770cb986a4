//! Trait contracts the turn pipeline calls through. Concrete providers
//! (Claude CLI, Gemini, Codex, ...) are out of scope for this crate (§1,
//! "Out of scope: LLM provider adapters") — only the interface the core
//! consumes lives here.

use async_trait::async_trait;
use storyforge_types::Message;

/// Sentinel prefix a provider adapter's error string carries (§7). The turn
/// pipeline recognizes this marker to decide whether to roll back the user
/// message (autonomous callers) or surface it verbatim (interactive HTTP).
pub const ERROR_MARKER: &str = "【系統錯誤】";

/// Returns true if `text` is a provider error sentinel rather than real GM
/// narrative content.
pub fn is_provider_error(text: &str) -> bool {
    text.starts_with(ERROR_MARKER)
}

/// A single non-streaming GM call's result. `text` starting with
/// [`ERROR_MARKER`] signals a provider failure (§7).
#[derive(Debug, Clone, PartialEq)]
pub struct GmReply {
    pub text: String,
    pub session_id: Option<String>,
}

impl GmReply {
    pub fn is_error(&self) -> bool {
        is_provider_error(&self.text)
    }
}

/// One event from a streaming GM call, mirroring the SSE contract in §6:
/// `{type:"text", chunk}` / `{type:"error", message}` / `{type:"done", ...}`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Error(String),
    Done(GmReply),
}

/// The read-only inputs a GM call needs: the augmented user message, the
/// assembled system prompt, and the recent-window messages for context.
/// `recent` excludes the just-saved user message — the adapter is expected
/// to append `user_message` as the final turn itself.
#[derive(Debug, Clone)]
pub struct GmRequest<'a> {
    pub user_message: &'a str,
    pub system_prompt: &'a str,
    pub recent: &'a [Message],
    pub session_id: Option<&'a str>,
}

/// An LLM provider adapter: streaming/one-shot GM calls, web-grounded
/// search, and story-summary generation (§1 lists these as out-of-scope
/// collaborators; this trait is the seam the core calls through).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn call_gm(&self, request: GmRequest<'_>) -> GmReply;

    /// Streams `StreamEvent`s onto `tx` as they arrive. The final event is
    /// always `Done` (success) or `Error` (failure) — never both, never
    /// neither, even if the receiving end is dropped mid-stream.
    async fn call_gm_stream(
        &self,
        request: GmRequest<'_>,
        tx: tokio::sync::mpsc::UnboundedSender<StreamEvent>,
    );

    /// A single-turn call with no conversation context, used by background
    /// workers (compaction, structured extraction, NPC evolution, snapshot
    /// summaries, state normalization). Returns an empty string on failure
    /// rather than an error sentinel — callers treat empty as "skip".
    async fn call_oneshot(&self, prompt: &str, system_prompt: Option<&str>) -> String;

    /// Generates a short prose summary of a full conversation transcript,
    /// used when a story is first imported.
    async fn generate_story_summary(&self, conversation_text: &str) -> String;

    /// Web-grounded search. Not every provider supports this; an adapter
    /// that doesn't may always return an empty string.
    async fn web_search(&self, query: &str) -> String;
}
