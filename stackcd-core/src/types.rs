//! Domain types for stackcd configuration.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All types are deserializable via serde + serde_yaml.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a tracked git repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RepoName(pub String);

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RepoName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RepoName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed name for a deployable stack.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StackName(pub String);

impl fmt::Display for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for StackName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StackName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Basic-auth credential for a git remote. A token can stand in for the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Never print the password.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Configuration structs
// ---------------------------------------------------------------------------

/// Deployment-affecting options carried through to the deployer untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StackOptions {
    /// Pin service images to their registry digests at deploy time.
    #[serde(default)]
    pub image_digests: bool,
    /// Prefix prepended to the stack name on the orchestration platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    /// Any other keys, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// A git remote tracked by stackcd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// File holding the password or token; trailing whitespace is trimmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
}

/// A stack definition tracked at a branch or a tag of a repo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub repo: RepoName,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub tag: String,
    /// Compose file path relative to the repository root.
    pub compose_file: PathBuf,
    /// Files to decrypt with sops, relative to the repository root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sops_files: Vec<PathBuf>,
    /// YAML values the compose file is rendered with, relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_file: Option<PathBuf>,
    /// Treat every file-backed secret of the compose file as sops-encrypted.
    #[serde(default = "default_true")]
    pub discover_secrets: bool,
    #[serde(flatten)]
    pub options: StackOptions,
}

impl StackConfig {
    /// A stack tracking `branch` with no sops files, values or extra options.
    pub fn new(repo: impl Into<RepoName>, branch: impl Into<String>, compose_file: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
            tag: String::new(),
            compose_file: compose_file.into(),
            sops_files: Vec::new(),
            values_file: None,
            discover_secrets: true,
            options: StackOptions::default(),
        }
    }
}

/// A stack key stackcd does not interpret.
///
/// Kept in [`StackOptions::extra`] and handed to the deployer, but most often
/// a misspelt setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKey {
    pub stack: StackName,
    pub key: String,
}

impl fmt::Display for UnknownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack '{}' has unknown key '{}'", self.stack, self.key)
    }
}

/// Root of the stackcd YAML configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between reconciliation cycles of a stack.
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Upper bound in seconds for a single cycle.
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout: u64,
    /// Where working copies live; relative paths resolve against the config file.
    #[serde(default = "default_repos_path")]
    pub repos_path: PathBuf,
    #[serde(default = "default_true")]
    pub auto_rotate: bool,
    #[serde(default = "default_sops_binary")]
    pub sops_binary: String,
    #[serde(default)]
    pub repos: BTreeMap<RepoName, RepoConfig>,
    #[serde(default)]
    pub stacks: BTreeMap<StackName, StackConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            cycle_timeout: default_cycle_timeout(),
            repos_path: default_repos_path(),
            auto_rotate: true,
            sops_binary: default_sops_binary(),
            repos: BTreeMap::new(),
            stacks: BTreeMap::new(),
        }
    }
}

fn default_update_interval() -> u64 {
    120
}

fn default_cycle_timeout() -> u64 {
    600
}

fn default_repos_path() -> PathBuf {
    PathBuf::from("repos")
}

fn default_true() -> bool {
    true
}

fn default_sops_binary() -> String {
    "sops".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
