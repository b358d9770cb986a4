//! A scripted [`storyforge_providers::LlmProvider`] for deterministic
//! tests. Replies are queued up front; each call pops the next one off the
//! front of the queue. Calling past the end of the queue returns a fixed
//! fallback reply rather than panicking, so a test that under-counts calls
//! still gets a readable failure downstream instead of a panic mid-turn.

use async_trait::async_trait;
use std::sync::Mutex;
use storyforge_providers::{GmReply, GmRequest, LlmProvider, StreamEvent};
use tokio::sync::mpsc::UnboundedSender;

/// Canned reply returned once the scripted queue runs dry.
const FALLBACK_GM_REPLY: &str = "（場景保持不變。）";

pub struct ScriptedProvider {
    name: String,
    gm_replies: Mutex<Vec<String>>,
    oneshot_replies: Mutex<Vec<String>>,
    summary_reply: String,
    search_reply: String,
}

impl ScriptedProvider {
    /// A provider that always replies with `reply` to `call_gm`/`call_gm_stream`.
    pub fn echoing(reply: impl Into<String>) -> Self {
        Self {
            name: "scripted".to_string(),
            gm_replies: Mutex::new(vec![reply.into()]),
            oneshot_replies: Mutex::new(Vec::new()),
            summary_reply: String::new(),
            search_reply: String::new(),
        }
    }

    /// A provider that replies to successive `call_gm`/`call_gm_stream`
    /// calls with `replies`, in order.
    pub fn scripted(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: "scripted".to_string(),
            gm_replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            oneshot_replies: Mutex::new(Vec::new()),
            summary_reply: String::new(),
            search_reply: String::new(),
        }
    }

    pub fn with_oneshot_replies(mut self, replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.oneshot_replies = Mutex::new(replies.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary_reply = summary.into();
        self
    }

    pub fn with_search_result(mut self, result: impl Into<String>) -> Self {
        self.search_reply = result.into();
        self
    }

    fn next_gm_reply(&self) -> String {
        let mut replies = self.gm_replies.lock().unwrap();
        if replies.is_empty() {
            FALLBACK_GM_REPLY.to_string()
        } else {
            replies.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
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
        let mut replies = self.oneshot_replies.lock().unwrap();
        if replies.is_empty() {
            String::new()
        } else {
            replies.remove(0)
        }
    }

    async fn generate_story_summary(&self, _conversation_text: &str) -> String {
        self.summary_reply.clone()
    }

    async fn web_search(&self, _query: &str) -> String {
        self.search_reply.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replies_are_consumed_in_order() {
        let provider = ScriptedProvider::scripted(["第一句", "第二句"]);
        let request = GmRequest {
            user_message: "前進",
            system_prompt: "",
            recent: &[],
            session_id: None,
        };
        assert_eq!(provider.call_gm(request.clone()).await.text, "第一句");
        assert_eq!(provider.call_gm(request).await.text, "第二句");
    }

    #[tokio::test]
    async fn exhausted_queue_falls_back_instead_of_panicking() {
        let provider = ScriptedProvider::echoing("唯一的回覆");
        let request = GmRequest {
            user_message: "前進",
            system_prompt: "",
            recent: &[],
            session_id: None,
        };
        assert_eq!(provider.call_gm(request.clone()).await.text, "唯一的回覆");
        assert_eq!(provider.call_gm(request).await.text, FALLBACK_GM_REPLY);
    }
}
