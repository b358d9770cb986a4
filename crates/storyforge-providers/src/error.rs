use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call failed: {0}")]
    Call(String),
    #[error("provider returned an empty response")]
    Empty,
    #[error("provider response was not valid JSON: {0}")]
    MalformedJson(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
