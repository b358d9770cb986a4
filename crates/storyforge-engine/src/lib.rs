//! The narrative state machine: branch tree operations, tag parsing, STATE
//! application and fate-dice resolution. This crate has no provider or
//! SQLite dependency of its own — it reads and writes the JSON files under
//! a [`storyforge_core::Workspace`] and hands scored text blocks up to
//! `storyforge-runtime` to assemble into prompts.

pub mod branch_tree;
pub mod cheats;
pub mod dice;
pub mod error;
pub mod npc;
pub mod schema;
pub mod state_updater;
pub mod tag_parser;

pub use error::{EngineError, Result};
