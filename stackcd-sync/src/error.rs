//! Error types for stackcd-sync.

use std::path::PathBuf;

use thiserror::Error;

use stackcd_core::types::RepoName;

use crate::definition::DefinitionError;
use crate::rotation::RotationError;
use crate::template::TemplateError;

/// All errors that can arise from synchronizing a repository or reconciling a stack.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Clone failed, or the existing working copy could not be opened.
    #[error("could not clone or open repo {repo}: {source}")]
    CloneOrOpen {
        repo: RepoName,
        #[source]
        source: git2::Error,
    },

    /// The remote rejected the credential, or demanded one that was not configured.
    ///
    /// Rewritten from the transport's generic "authentication required" so
    /// operators look at the credential's validity and scope.
    #[error("authentication failed for repo {repo} while {operation}")]
    Authentication { repo: RepoName, operation: String },

    #[error("could not checkout {reference} in {repo}: {source}")]
    Checkout {
        repo: RepoName,
        reference: String,
        #[source]
        source: git2::Error,
    },

    #[error("could not pull {branch} branch in {repo} repo: {source}")]
    Pull {
        repo: RepoName,
        branch: String,
        #[source]
        source: git2::Error,
    },

    #[error("could not fetch tag {tag} in {repo} repo: {source}")]
    Fetch {
        repo: RepoName,
        tag: String,
        #[source]
        source: git2::Error,
    },

    #[error("could not get HEAD commit hash of {reference} in {repo} repo: {source}")]
    HeadResolution {
        repo: RepoName,
        reference: String,
        #[source]
        source: git2::Error,
    },

    /// The compose file could not be read from the working copy.
    #[error("could not read {path} from {repo} repo: {source}")]
    ReadDefinition {
        repo: RepoName,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not render {path} with values from {values}: {source}")]
    Render {
        path: PathBuf,
        values: PathBuf,
        #[source]
        source: TemplateError,
    },

    /// Malformed YAML, or a document that is not a mapping.
    #[error("could not parse compose file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: DefinitionError,
    },

    #[error("could not discover secrets in {path}: {source}")]
    SecretDiscovery {
        path: PathBuf,
        #[source]
        source: DefinitionError,
    },

    #[error("could not rotate {kind}: {source}")]
    Rotation {
        kind: String,
        #[source]
        source: RotationError,
    },

    /// A file the definition references has the wrong shape or leaves the repository.
    #[error("could not stage files referenced by {path}: {source}")]
    StageDefinition {
        path: PathBuf,
        #[source]
        source: DefinitionError,
    },

    /// A file the definition references could not be copied out of the working copy.
    #[error("could not stage {path}: {source}")]
    StageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
