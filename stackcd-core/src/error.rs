//! Error types for stackcd-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{RepoName, StackName};

/// All errors that can arise from loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, with the path that was being read.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load — includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.stackcd/`.
    #[error("cannot determine home directory; set $HOME or pass --config")]
    HomeNotFound,

    /// The config file did not exist at the expected path.
    #[error("config not found at {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("stack '{stack}' references unknown repo '{repo}'")]
    UnknownRepo { stack: StackName, repo: RepoName },

    #[error("stack '{stack}' must set a branch or a tag")]
    MissingRef { stack: StackName },

    #[error("stack '{stack}' has an empty compose_file")]
    MissingComposeFile { stack: StackName },

    #[error("repo '{repo}' has an empty url")]
    MissingUrl { repo: RepoName },

    #[error("repo '{repo}' sets both password and password_file")]
    AmbiguousPassword { repo: RepoName },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
