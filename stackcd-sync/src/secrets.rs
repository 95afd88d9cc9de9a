//! Secret file discovery.

use std::path::{Component, Path, PathBuf};

use crate::definition::{object_refs, ComposeDefinition, DefinitionError, SECRETS};
use crate::error::SyncError;

/// Files referenced by the non-external entries under `secrets`.
///
/// Paths are resolved against the directory holding `definition_path` (not the
/// repository root), in document order. Entries that are external or have no
/// `file` contribute nothing; a missing `secrets` key yields an empty list.
pub fn discover_secrets(
    definition: &ComposeDefinition,
    definition_path: &Path,
) -> Result<Vec<PathBuf>, SyncError> {
    let discovery_err = |source| SyncError::SecretDiscovery {
        path: definition_path.to_path_buf(),
        source,
    };

    let Some(secrets) = definition.section(SECRETS).map_err(discovery_err)? else {
        return Ok(Vec::new());
    };
    let refs = object_refs(SECRETS, secrets).map_err(discovery_err)?;

    refs.into_iter()
        .filter(|object| !object.external)
        .filter_map(|object| {
            let file = object.file?;
            Some(repo_file_path(SECRETS, &object.name, definition_path, &file))
        })
        .collect::<Result<_, _>>()
        .map_err(discovery_err)
}

/// `file` relative to the directory of `definition_path`, lexically normalized.
pub fn object_file_path(definition_path: &Path, file: &Path) -> PathBuf {
    let dir = definition_path.parent().unwrap_or_else(|| Path::new(""));
    normalize(&dir.join(file))
}

/// [`object_file_path`] for entry `name` of `section`, refused when it leaves
/// the repository root.
pub fn repo_file_path(
    section: &str,
    name: &str,
    definition_path: &Path,
    file: &Path,
) -> Result<PathBuf, DefinitionError> {
    let path = object_file_path(definition_path, file);
    let escapes = path.has_root()
        || matches!(
            path.components().next(),
            Some(Component::ParentDir | Component::Prefix(_))
        );
    if escapes {
        return Err(DefinitionError::OutsideRepository {
            section: section.to_string(),
            name: name.to_string(),
            file: file.to_path_buf(),
        });
    }
    Ok(path)
}

/// Drop `.` components and fold `..` into its parent without touching the disk.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
