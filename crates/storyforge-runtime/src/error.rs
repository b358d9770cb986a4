use thiserror::Error;

/// Errors the turn pipeline and background workers surface. Component-local
/// errors from `storyforge-core`/`storyforge-engine`/`storyforge-index` are
/// composed in via `#[from]` rather than re-stringified (§7, §10).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Core(#[from] storyforge_core::CoreError),

    #[error(transparent)]
    Engine(#[from] storyforge_engine::EngineError),

    #[error(transparent)]
    Index(#[from] anyhow::Error),

    #[error("branch {0} is not writable (deleted or merged)")]
    BranchNotWritable(String),

    #[error("empty message")]
    EmptyMessage,

    #[error("provider returned an error: {0}")]
    ProviderError(String),

    #[error("invalid configuration at {key} ({source}): {message}")]
    Config {
        key: String,
        source: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
