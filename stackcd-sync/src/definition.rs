//! Parsed compose definition.
//!
//! The document is kept as an order-preserving [`serde_yaml::Mapping`] rather
//! than a typed compose model: stackcd only interprets `secrets` and
//! `configs`, and everything else must reach the deployer untouched.
//! Accessors are fallible and report the shape they found instead of
//! assuming one.

use std::path::PathBuf;

use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Top-level keys stackcd understands.
pub const SERVICES: &str = "services";
pub const SECRETS: &str = "secrets";
pub const CONFIGS: &str = "configs";
pub const ENV_FILE: &str = "env_file";

/// Shape errors found while reading a compose definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("top-level document must be a mapping, found {found}")]
    NotAMapping { found: &'static str },

    #[error("`{key}` must be a mapping, found {found}")]
    SectionNotAMapping { key: String, found: &'static str },

    #[error("`{section}` has a non-string key")]
    NonStringKey { section: String },

    #[error("`{section}.{name}` must be a mapping, found {found}")]
    EntryNotAMapping {
        section: String,
        name: String,
        found: &'static str,
    },

    #[error("`{section}.{name}` references {file}, which is outside the repository")]
    OutsideRepository {
        section: String,
        name: String,
        file: PathBuf,
    },

    #[error("`{section}.{name}.{field}` must be a {expected}, found {found}")]
    InvalidField {
        section: String,
        name: String,
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

/// A parsed compose file. Recomputed every cycle, never cached.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeDefinition {
    root: Mapping,
}

impl ComposeDefinition {
    /// Parse raw bytes; the document must be a mapping.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DefinitionError> {
        match serde_yaml::from_slice::<Value>(bytes)? {
            Value::Mapping(root) => Ok(Self { root }),
            other => Err(DefinitionError::NotAMapping {
                found: kind_of(&other),
            }),
        }
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.root
    }

    /// A top-level mapping section, `None` when the key is absent or null.
    pub fn section(&self, key: &str) -> Result<Option<&Mapping>, DefinitionError> {
        match self.root.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Mapping(map)) => Ok(Some(map)),
            Some(other) => Err(DefinitionError::SectionNotAMapping {
                key: key.to_string(),
                found: kind_of(other),
            }),
        }
    }

    pub fn section_mut(&mut self, key: &str) -> Result<Option<&mut Mapping>, DefinitionError> {
        match self.root.get_mut(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Mapping(map)) => Ok(Some(map)),
            Some(other) => Err(DefinitionError::SectionNotAMapping {
                key: key.to_string(),
                found: kind_of(other),
            }),
        }
    }

    /// Names of the declared services, in document order.
    pub fn service_names(&self) -> Result<Vec<String>, DefinitionError> {
        let Some(services) = self.section(SERVICES)? else {
            return Ok(Vec::new());
        };
        services
            .keys()
            .map(|key| {
                key.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DefinitionError::NonStringKey {
                        section: SERVICES.to_string(),
                    })
            })
            .collect()
    }

    /// Every `services.<name>.env_file` reference, in document order.
    ///
    /// Accepts a single path, a list of paths, and the long form
    /// `{path, required}`.
    pub fn env_files(&self) -> Result<Vec<EnvFileRef>, DefinitionError> {
        let Some(services) = self.section(SERVICES)? else {
            return Ok(Vec::new());
        };
        let mut refs = Vec::new();
        for (key, value) in services {
            let service = key.as_str().ok_or_else(|| DefinitionError::NonStringKey {
                section: SERVICES.to_string(),
            })?;
            let entry = match value {
                Value::Null => continue,
                Value::Mapping(map) => map,
                other => {
                    return Err(DefinitionError::EntryNotAMapping {
                        section: SERVICES.to_string(),
                        name: service.to_string(),
                        found: kind_of(other),
                    })
                }
            };
            let invalid = |found: &Value| DefinitionError::InvalidField {
                section: SERVICES.to_string(),
                name: service.to_string(),
                field: ENV_FILE,
                expected: "path or list of paths",
                found: kind_of(found),
            };
            let items: Vec<&Value> = match entry.get(ENV_FILE) {
                None | Some(Value::Null) => continue,
                Some(Value::Sequence(items)) => items.iter().collect(),
                Some(single) => vec![single],
            };
            for item in items {
                let (file, required) = match item {
                    Value::String(file) => (file, true),
                    Value::Mapping(long) => match (long.get("path"), long.get("required")) {
                        (Some(Value::String(file)), None) => (file, true),
                        (Some(Value::String(file)), Some(Value::Bool(required))) => (file, *required),
                        _ => return Err(invalid(item)),
                    },
                    other => return Err(invalid(other)),
                };
                refs.push(EnvFileRef {
                    service: service.to_string(),
                    file: PathBuf::from(file),
                    required,
                });
            }
        }
        Ok(refs)
    }

    pub fn to_yaml_string(&self) -> Result<String, DefinitionError> {
        Ok(serde_yaml::to_string(&self.root)?)
    }
}

/// One entry under `secrets` or `configs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub name: String,
    pub external: bool,
    /// Relative to the compose file's directory.
    pub file: Option<PathBuf>,
    /// Platform-side name override (`name:`), if set.
    pub platform_name: Option<String>,
}

/// One `env_file` reference of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvFileRef {
    pub service: String,
    /// As written; relative to the compose file's directory.
    pub file: PathBuf,
    /// `false` lets the file be missing.
    pub required: bool,
}

/// Read every entry of a `secrets` / `configs` mapping, in document order.
pub fn object_refs(section: &str, objects: &Mapping) -> Result<Vec<ObjectRef>, DefinitionError> {
    objects
        .iter()
        .map(|(key, value)| object_ref(section, key, value))
        .collect()
}

fn object_ref(section: &str, key: &Value, value: &Value) -> Result<ObjectRef, DefinitionError> {
    let name = key
        .as_str()
        .ok_or_else(|| DefinitionError::NonStringKey {
            section: section.to_string(),
        })?
        .to_string();

    let empty = Mapping::new();
    let entry = match value {
        Value::Null => &empty,
        Value::Mapping(map) => map,
        other => {
            return Err(DefinitionError::EntryNotAMapping {
                section: section.to_string(),
                name,
                found: kind_of(other),
            })
        }
    };

    let invalid = |field: &'static str, expected: &'static str, found: &Value| {
        DefinitionError::InvalidField {
            section: section.to_string(),
            name: name.clone(),
            field,
            expected,
            found: kind_of(found),
        }
    };

    // `external: {name: ...}` is the legacy compose spelling of an external object.
    let external = match entry.get("external") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Mapping(_)) => true,
        Some(other) => return Err(invalid("external", "boolean", other)),
    };

    let file = match entry.get("file") {
        None | Some(Value::Null) => None,
        Some(Value::String(file)) => Some(PathBuf::from(file)),
        Some(other) => return Err(invalid("file", "string", other)),
    };

    let platform_name = match entry.get("name") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(other) => return Err(invalid("name", "string", other)),
    };

    Ok(ObjectRef {
        name,
        external,
        file,
        platform_name,
    })
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
