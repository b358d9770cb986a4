//! A placeholder [`LlmProvider`]. Concrete LLM adapters are out of scope
//! for this workspace (`storyforge-providers` only defines the trait) - this
//! exists purely so the auto-play binary has something to drive against
//! without a real API key. It does not call out to any network service and
//! produces only generic, deterministic narrative filler. Replace it with a
//! real adapter (Claude, Gemini, ...) before using this binary for anything
//! but smoke-testing the turn pipeline.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use storyforge_providers::{GmReply, GmRequest, LlmProvider, StreamEvent};
use tokio::sync::mpsc::UnboundedSender;

const GM_FILLER: &[&str] = &[
    "四周安靜下來，只有遠處傳來隱約的機械運轉聲。",
    "你的行動似乎引起了些許騷動，但暫時沒有危險逼近。",
    "空氣中瀰漫著一股說不出的氣味，場景隨你的選擇緩緩展開。",
    "周遭的光線忽明忽暗，彷彿在回應你剛才的決定。",
];

const PLAYER_FILLER: &[&str] = &[
    "我小心地觀察四周，確認沒有立即的威脅後才繼續前進。",
    "我檢查了一下身上的裝備，然後朝著看起來最安全的方向走去。",
    "我試著和附近看起來友善的人交談，打聽這裡的情況。",
    "我決定先找個地方躲起來，觀察一下情勢再行動。",
];

pub struct PlaceholderProvider {
    gm_calls: AtomicUsize,
    oneshot_calls: AtomicUsize,
}

impl PlaceholderProvider {
    pub fn new() -> Self {
        Self {
            gm_calls: AtomicUsize::new(0),
            oneshot_calls: AtomicUsize::new(0),
        }
    }

    fn next_gm_reply(&self) -> String {
        let i = self.gm_calls.fetch_add(1, Ordering::Relaxed);
        GM_FILLER[i % GM_FILLER.len()].to_string()
    }

    /// Cycles through a short list of generic player actions. A real player
    /// AI would read `prompt` (the assembled context) and respond in
    /// character; this placeholder ignores it entirely.
    pub fn next_player_action(&self) -> String {
        let i = self.oneshot_calls.fetch_add(1, Ordering::Relaxed);
        PLAYER_FILLER[i % PLAYER_FILLER.len()].to_string()
    }
}

impl Default for PlaceholderProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for PlaceholderProvider {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn call_gm(&self, _request: GmRequest<'_>) -> GmReply {
        GmReply {
            text: self.next_gm_reply(),
            session_id: None,
        }
    }

    async fn call_gm_stream(&self, _request: GmRequest<'_>, tx: UnboundedSender<StreamEvent>) {
        let reply = GmReply {
            text: self.next_gm_reply(),
            session_id: None,
        };
        let _ = tx.send(StreamEvent::Text(reply.text.clone()));
        let _ = tx.send(StreamEvent::Done(reply));
    }

    async fn call_oneshot(&self, _prompt: &str, _system_prompt: Option<&str>) -> String {
        self.next_player_action()
    }

    async fn generate_story_summary(&self, _conversation_text: &str) -> String {
        String::new()
    }

    async fn web_search(&self, _query: &str) -> String {
        String::new()
    }
}
