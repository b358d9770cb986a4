//! `TestWorld` pattern for declarative integration test setup, mirroring
//! the CLI-driving `TestWorld` this workspace's teacher uses but wrapping a
//! [`storyforge_sdk::Client`] directly rather than shelling out to a
//! binary, since most of this crate's surface is a library API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use storyforge_providers::LlmProvider;
use storyforge_sdk::Client;
use storyforge_types::{BranchId, StoryId};
use tempfile::TempDir;

use crate::providers::ScriptedProvider;

/// Builder for constructing a [`TestWorld`] with a specific provider and
/// root directory.
pub struct TestWorldBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
}

impl TestWorldBuilder {
    pub fn new() -> Self {
        Self { provider: None }
    }

    /// Supplies a specific provider instead of the default echoing stub.
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> TestWorld {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path().to_path_buf();
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(ScriptedProvider::echoing("（故事繼續。）")) as Arc<dyn LlmProvider>);
        let client = Client::builder()
            .root(&root)
            .provider(provider)
            .build()
            .expect("client builds against a fresh temp workspace");
        TestWorld { temp_dir, root, client }
    }
}

impl Default for TestWorldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An isolated workspace plus a [`Client`] wired to a scripted provider by
/// default. Dropping the world removes the temp directory.
pub struct TestWorld {
    temp_dir: TempDir,
    root: PathBuf,
    client: Client,
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorld {
    pub fn builder() -> TestWorldBuilder {
        TestWorldBuilder::new()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Runs `init` and returns the active story/branch ids, matching the
    /// pair nearly every test needs before it can send a turn.
    pub fn init(&self) -> (StoryId, BranchId) {
        let info = self.client.init().expect("init succeeds against a fresh workspace");
        (info.active_story_id, info.active_branch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_world_inits_a_default_story() {
        let world = TestWorld::new();
        let (story, branch) = world.init();
        assert_eq!(story.as_str(), "story_original");
        assert!(branch.is_root());
    }

    #[tokio::test]
    async fn world_can_send_a_turn_against_the_default_provider() {
        let world = TestWorld::new();
        let (story, branch) = world.init();
        let outcome = world
            .client()
            .send_message(&story, &branch, "我走進了房間。", "")
            .await
            .unwrap();
        assert!(matches!(outcome, storyforge_sdk::TurnOutcome::Turn(_)));
    }
}
