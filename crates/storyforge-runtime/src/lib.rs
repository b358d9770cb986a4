//! Turn orchestration and background workers sitting on top of
//! `storyforge-engine`/`storyforge-index`/`storyforge-core`: the pieces that
//! need an LLM provider, wall-clock time, or a tokio runtime, which the
//! deterministic engine crate deliberately stays free of.

pub mod config;
pub mod context;
pub mod error;
pub mod extraction;
pub mod npc_evolution;
pub mod phase;
pub mod recap;
pub mod review;
pub mod snapshots;
pub mod turn;
pub mod usage;
pub mod workers;
pub mod world_clock;

pub use config::{NpcEvolutionConfig, RecapConfig, RuntimeConfig, StateReviewMode};
pub use error::{Result, RuntimeError};
pub use turn::{run_turn, TurnOutcome};
