use thiserror::Error;

/// Errors surfaced by the embedding facade. Component-local errors are
/// composed in via `#[from]` rather than re-stringified, same stance as
/// every crate underneath (§7).
#[derive(Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Runtime(#[from] storyforge_runtime::RuntimeError),

    #[error(transparent)]
    Engine(#[from] storyforge_engine::EngineError),

    #[error(transparent)]
    Core(#[from] storyforge_core::CoreError),

    #[error(transparent)]
    Index(#[from] anyhow::Error),

    #[error("story {0} not found")]
    StoryNotFound(String),

    #[error("story name required")]
    StoryNameRequired,

    #[error("message {index} not found on branch {branch}")]
    MessageNotFound { branch: String, index: i64 },

    #[error("message {index} on branch {branch} is not a player message and cannot be edited or regenerated")]
    NotAPlayerMessage { branch: String, index: i64 },
}

pub type Result<T> = std::result::Result<T, SdkError>;
