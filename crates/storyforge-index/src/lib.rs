//! SQLite-backed search indexes over a story's lore, events and character
//! state. Each story gets its own `lore.db` / `events.db` / a per-branch
//! `state.db`; all three are rebuildable from the JSON files that remain
//! the source of truth, so a corrupt or missing index is never fatal.

pub mod db;
pub mod events;
pub mod keywords;
pub mod lore;
pub mod state;

pub use db::Database;
pub use events::EventIndex;
pub use lore::LoreIndex;
pub use state::StateIndex;

pub type Result<T> = anyhow::Result<T>;
