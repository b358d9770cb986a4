//! storyforge-sdk: the public embedding API for the storyforge narrative
//! engine.
//!
//! # Overview
//!
//! This crate is a facade over `storyforge-core`, `storyforge-engine`,
//! `storyforge-index` and `storyforge-runtime`: an embedder (the
//! `storyforge` auto-play CLI, or a future HTTP server) drives a single
//! [`Client`] instead of wiring those four crates together itself. The
//! facade's surface mirrors the HTTP API contracts this system was
//! designed around (init, send, messages, branch lifecycle, story
//! lifecycle) so a thin HTTP layer can be built on top of it without
//! reimplementing any of the orchestration.
//!
//! # Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use storyforge_sdk::Client;
//! use storyforge_types::{BranchId, StoryId};
//!
//! # async fn run(provider: Arc<dyn storyforge_providers::LlmProvider>) -> storyforge_sdk::Result<()> {
//! let client = Client::builder().root("./workspace").provider(provider).build()?;
//! let info = client.init()?;
//! let outcome = client.send_message(&info.active_story_id, &info.active_branch_id, "我往前走。", "").await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - `storyforge-types`: plain domain models, no I/O.
//! - `storyforge-core`: atomic JSON storage and per-branch locking.
//! - `storyforge-engine`: the deterministic branch/state/tag machinery.
//! - `storyforge-index`: SQLite-backed lore/event search.
//! - `storyforge-runtime`: the turn pipeline and background workers, the
//!   only layer that needs an LLM provider or a tokio runtime.
//!
//! Concrete provider adapters are out of scope for this whole workspace
//! (§1) - callers supply their own [`storyforge_providers::LlmProvider`]
//! when building a [`Client`].

pub mod client;
pub mod error;
pub mod story;

pub use client::{Client, ClientBuilder, InitInfo, MessagesPage, MessagesQuery, Turn};
pub use error::{Result, SdkError};
pub use story::{StoriesRegistry, StoryRecord};
pub use storyforge_runtime::turn::TurnOutcome;
