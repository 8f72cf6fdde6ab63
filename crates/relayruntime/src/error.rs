use relaycore::{RunId, ValidationErrors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Invalid graph: {0}")]
    Validation(#[from] ValidationErrors),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
