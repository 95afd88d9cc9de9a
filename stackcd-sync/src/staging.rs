//! Files the deployer needs, copied out of the working copy under the lock.
//!
//! Deploys run after the repository lock is released, when another stack may
//! already have checked out a different ref. Everything the definition points
//! at is therefore captured here as bytes: object files that rotation did not
//! already read, and service `env_file`s.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::definition::{ComposeDefinition, EnvFileRef, SERVICES};
use crate::error::SyncError;
use crate::rotation::{managed_objects, ObjectContent, ObjectKind, RotatedObject};
use crate::secrets::repo_file_path;

/// A secret or config carried verbatim under its document name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedObject {
    pub kind: ObjectKind,
    pub name: String,
    pub content: ObjectContent,
}

/// One service `env_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub service: String,
    /// As written in the definition.
    pub file: PathBuf,
    pub content: ObjectContent,
}

/// Read every managed object that is not in `rotated`.
pub fn stage_objects(
    definition: &ComposeDefinition,
    workdir: &Path,
    definition_path: &Path,
    rotated: &[RotatedObject],
) -> Result<Vec<StagedObject>, SyncError> {
    let shape_err = |source| SyncError::StageDefinition {
        path: definition_path.to_path_buf(),
        source,
    };

    let mut staged = Vec::new();
    for kind in [ObjectKind::Secrets, ObjectKind::Configs] {
        let Some(objects) = definition.section(kind.as_str()).map_err(shape_err)? else {
            continue;
        };
        for (object, file) in managed_objects(objects, kind, definition_path).map_err(shape_err)? {
            let done = rotated
                .iter()
                .any(|r| r.kind == kind && r.name == object.name);
            if done {
                continue;
            }
            let content = read(workdir, &file)?;
            staged.push(StagedObject {
                kind,
                name: object.name,
                content,
            });
        }
    }
    Ok(staged)
}

/// Read every service `env_file`. A missing file marked `required: false` is skipped.
pub fn stage_env_files(
    definition: &ComposeDefinition,
    workdir: &Path,
    definition_path: &Path,
) -> Result<Vec<StagedFile>, SyncError> {
    let shape_err = |source| SyncError::StageDefinition {
        path: definition_path.to_path_buf(),
        source,
    };

    let mut staged = Vec::new();
    for EnvFileRef {
        service,
        file,
        required,
    } in definition.env_files().map_err(shape_err)?
    {
        let path = repo_file_path(SERVICES, &service, definition_path, &file).map_err(shape_err)?;
        match std::fs::read(workdir.join(&path)) {
            Ok(bytes) => staged.push(StagedFile {
                service,
                file,
                content: bytes.into(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound && !required => {
                tracing::debug!(service = %service, file = %path.display(), "optional env_file absent");
            }
            Err(source) => return Err(SyncError::StageRead { path, source }),
        }
    }
    Ok(staged)
}

fn read(workdir: &Path, file: &Path) -> Result<ObjectContent, SyncError> {
    std::fs::read(workdir.join(file))
        .map(ObjectContent::from)
        .map_err(|source| SyncError::StageRead {
            path: file.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workdir_with(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (path, content) in files {
            let full = tmp.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        tmp
    }

    fn parse(yaml: &str) -> ComposeDefinition {
        ComposeDefinition::from_slice(yaml.as_bytes()).unwrap()
    }

    #[test]
    fn unrotated_objects_are_read_relative_to_the_definition() {
        let tmp = workdir_with(&[("stacks/db.txt", "hunter2"), ("stacks/nginx.conf", "server {}")]);
        let def = parse(
            "secrets:\n  db:\n    file: db.txt\n  tls:\n    external: true\nconfigs:\n  nginx:\n    file: nginx.conf\n",
        );

        let staged = stage_objects(&def, tmp.path(), Path::new("stacks/compose.yaml"), &[]).unwrap();

        let names: Vec<_> = staged.iter().map(|s| (s.kind, s.name.as_str())).collect();
        assert_eq!(names, vec![(ObjectKind::Secrets, "db"), (ObjectKind::Configs, "nginx")]);
        assert_eq!(staged[0].content.as_bytes(), b"hunter2");
    }

    #[test]
    fn rotated_objects_are_not_staged_again() {
        let tmp = workdir_with(&[("db.txt", "hunter2")]);
        let def = parse("secrets:\n  db:\n    file: db.txt\n");
        let rotated = RotatedObject {
            kind: ObjectKind::Secrets,
            name: "db".into(),
            versioned_name: "db-0badc0de".into(),
            digest: String::new(),
            status: crate::rotation::RotationStatus::Rotated,
            content: b"hunter2".to_vec().into(),
        };

        let staged = stage_objects(&def, tmp.path(), Path::new("compose.yaml"), &[rotated]).unwrap();
        assert!(staged.is_empty());
    }

    #[test]
    fn missing_object_file_is_a_stage_error() {
        let tmp = TempDir::new().unwrap();
        let def = parse("configs:\n  nginx:\n    file: nginx.conf\n");
        let err = stage_objects(&def, tmp.path(), Path::new("compose.yaml"), &[]).unwrap_err();
        assert!(matches!(err, SyncError::StageRead { ref path, .. } if path == Path::new("nginx.conf")));
    }

    #[test]
    fn env_files_keep_the_spelling_of_the_definition() {
        let tmp = workdir_with(&[("stacks/web.env", "PORT=80\n")]);
        let def = parse("services:\n  web:\n    env_file: ./web.env\n");

        let staged = stage_env_files(&def, tmp.path(), Path::new("stacks/compose.yaml")).unwrap();

        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].service, "web");
        assert_eq!(staged[0].file, PathBuf::from("./web.env"));
        assert_eq!(staged[0].content.as_bytes(), b"PORT=80\n");
    }

    #[test]
    fn optional_env_file_may_be_missing() {
        let tmp = TempDir::new().unwrap();
        let def = parse("services:\n  web:\n    env_file:\n      - path: local.env\n        required: false\n");
        let staged = stage_env_files(&def, tmp.path(), Path::new("compose.yaml")).unwrap();
        assert!(staged.is_empty());
    }

    #[test]
    fn required_env_file_must_exist() {
        let tmp = TempDir::new().unwrap();
        let def = parse("services:\n  web:\n    env_file: web.env\n");
        let err = stage_env_files(&def, tmp.path(), Path::new("compose.yaml")).unwrap_err();
        assert!(matches!(err, SyncError::StageRead { .. }), "got: {err}");
    }

    #[test]
    fn env_file_outside_the_repository_is_refused() {
        let tmp = TempDir::new().unwrap();
        let def = parse("services:\n  web:\n    env_file: /etc/environment\n");
        let err = stage_env_files(&def, tmp.path(), Path::new("compose.yaml")).unwrap_err();
        assert!(err.to_string().contains("outside the repository"), "got: {err}");
    }
}
