use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] storyforge_core::CoreError),
    #[error("branch {0} not found")]
    BranchNotFound(String),
    #[error("branch {0} is not writable (active generation in progress)")]
    BranchNotWritable(String),
    #[error("cannot delete the root branch")]
    CannotDeleteRoot(),
    #[error("branch {0} has children and cannot be deleted directly")]
    BranchHasChildren(String),
    #[error("no character schema authored for this story")]
    MissingSchema(),
    #[error("branch name required")]
    NameRequired(),
    #[error("parent branch {0} not found")]
    ParentNotFound(String),
    #[error("cannot promote or merge the root branch")]
    CannotTargetRoot(),
    #[error("branch {0} is deleted")]
    BranchDeleted(String),
    #[error("branch {0} is already merged")]
    AlreadyMerged(String),
    #[error("branch {0} has no parent")]
    NoParent(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
