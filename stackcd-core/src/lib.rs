//! stackcd core library — domain types, configuration loading, errors.
//!
//! - [`types`] — newtypes and configuration structs
//! - [`error`] — [`ConfigError`]
//! - [`config`] — load / validate / path resolution

pub mod config;
pub mod error;
pub mod types;

pub use error::ConfigError;
pub use types::{
    Config, Credential, RepoConfig, RepoName, StackConfig, StackName, StackOptions, UnknownKey,
};
