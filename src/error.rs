use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for a single command invocation.
///
/// Every variant renders as a single human-readable line; `main` prints it
/// and exits with status 1. Nothing here is retried.
#[derive(Debug, Error)]
pub enum Error {
    /// A host capability or file the operation depends on is missing.
    #[error("{0}")]
    Precondition(String),

    /// User-supplied input was rejected before any state was mutated.
    #[error("{0}")]
    Validation(String),

    /// The named machine has no configuration file.
    #[error("The machine {0} does not exist")]
    MachineNotFound(String),

    /// An external host tool exited non-zero (or could not be spawned).
    #[error("{tool}: {detail}")]
    CommandFailed { tool: String, detail: String },

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Error {
        Error::Precondition(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Error {
        Error::Validation(msg.into())
    }
}
