//! YAML configuration loading and validation.
//!
//! # Storage layout
//!
//! ```text
//! ~/.stackcd/
//!   config.yaml      (repos + stacks + scheduler settings)
//!   repos/
//!     <repo_name>/   (one working copy per repo, cloned on first start)
//! ```
//!
//! # API pattern
//!
//! Loading has two forms:
//! - `load_at(path)` — explicit file; used in tests with `TempDir`
//! - `load()` — derives the path from `$STACKCD_CONFIG` or `dirs::home_dir()`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use crate::error::{io_err, ConfigError};
use crate::types::{Config, Credential, RepoConfig, RepoName, UnknownKey};

/// Environment variable that overrides the default config location.
pub const CONFIG_ENV: &str = "STACKCD_CONFIG";

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.stackcd/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".stackcd").join("config.yaml")
}

/// Config path from `$STACKCD_CONFIG`, falling back to `~/.stackcd/config.yaml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(config_path_at(&home()?)),
    }
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and validate the config file at `path`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&default_config_path()?)
}

// ---------------------------------------------------------------------------
// 3. Validation and resolution
// ---------------------------------------------------------------------------

impl Config {
    /// Check cross-references and required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_interval == 0 {
            return Err(ConfigError::Invalid(
                "update_interval must be greater than zero".to_string(),
            ));
        }
        if self.cycle_timeout == 0 {
            return Err(ConfigError::Invalid(
                "cycle_timeout must be greater than zero".to_string(),
            ));
        }
        for (name, repo) in &self.repos {
            if repo.url.trim().is_empty() {
                return Err(ConfigError::MissingUrl { repo: name.clone() });
            }
            if repo.password.is_some() && repo.password_file.is_some() {
                return Err(ConfigError::AmbiguousPassword { repo: name.clone() });
            }
        }
        for (name, stack) in &self.stacks {
            if !self.repos.contains_key(&stack.repo) {
                return Err(ConfigError::UnknownRepo {
                    stack: name.clone(),
                    repo: stack.repo.clone(),
                });
            }
            if stack.branch.is_empty() && stack.tag.is_empty() {
                return Err(ConfigError::MissingRef { stack: name.clone() });
            }
            if stack.compose_file.as_os_str().is_empty() {
                return Err(ConfigError::MissingComposeFile { stack: name.clone() });
            }
            for file in stack.sops_files.iter().chain(&stack.values_file) {
                if file.is_absolute() {
                    return Err(ConfigError::Invalid(format!(
                        "stack '{name}': {} must be relative to the repository root",
                        file.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stack keys that no setting claimed, in stack order.
    ///
    /// Not an error: unknown keys still reach the deployer verbatim.
    pub fn unknown_keys(&self) -> Vec<UnknownKey> {
        self.stacks
            .iter()
            .flat_map(|(name, stack)| {
                stack.options.extra.keys().map(|key| UnknownKey {
                    stack: name.clone(),
                    key: key.clone(),
                })
            })
            .collect()
    }

    /// Directory holding the working copies, resolved against the config file's directory.
    pub fn repos_dir(&self, config_path: &Path) -> PathBuf {
        if self.repos_path.is_absolute() {
            return self.repos_path.clone();
        }
        config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.repos_path)
    }

    /// Working-copy path of a single repo.
    pub fn repo_path(&self, config_path: &Path, repo: &RepoName) -> PathBuf {
        self.repos_dir(config_path).join(&repo.0)
    }
}

impl RepoConfig {
    /// Build the basic-auth credential, reading `password_file` if set.
    ///
    /// No username means anonymous access.
    pub fn credential(&self) -> Result<Option<Credential>, ConfigError> {
        let Some(username) = self.username.as_ref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let password = match (&self.password, &self.password_file) {
            (Some(password), _) => password.clone(),
            (None, Some(file)) => std::fs::read_to_string(file)
                .map_err(|e| io_err(file, e))?
                .trim_end()
                .to_string(),
            (None, None) => String::new(),
        };
        Ok(Some(Credential::new(username.clone(), password)))
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
