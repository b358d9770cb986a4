//! Internal testing utilities for the storyforge engine. Not intended for
//! direct use outside this workspace.
//!
//! - [`TestWorld`]: fluent interface for declarative test setup on top of a
//!   real [`storyforge_sdk::Client`].
//! - `providers`: a scripted [`storyforge_providers::LlmProvider`] so tests
//!   never touch a real LLM.
//! - `fixtures`: sample character schemas and conversations.
//! - `assertions`: small helpers for common shape checks.

pub mod assertions;
pub mod fixtures;
pub mod providers;
pub mod world;

pub use providers::ScriptedProvider;
pub use world::TestWorld;
