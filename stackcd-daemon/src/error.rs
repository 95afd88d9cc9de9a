use std::path::PathBuf;

use thiserror::Error;

use stackcd_core::types::{RepoName, StackName};

/// Error surface for the scheduler runtime and deployers.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cycle(#[from] stackcd_sync::CycleError),

    #[error("stack {stack}: cycle did not finish within {seconds}s")]
    Timeout { stack: StackName, seconds: u64 },

    /// The reconcile of an earlier tick, possibly timed out, still holds the stack.
    #[error("stack {stack}: previous cycle still running")]
    Busy { stack: StackName },

    #[error("could not deploy stack {stack}: {message}")]
    Deploy { stack: StackName, message: String },

    #[error("no stack could be scheduled; {failed} repo(s) failed to open")]
    NoStacks { failed: usize },

    #[error("repo {repo} is not available")]
    RepoUnavailable { repo: RepoName },

    #[error("{task} task join failure: {message}")]
    Join { task: String, message: String },

    #[error("signal handler failed: {0}")]
    Signal(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
