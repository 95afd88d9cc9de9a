//! Deployment collaborators.
//!
//! A [`Deployer`] receives a [`ResolvedStack`] after its cycle released the
//! repository lock. The working copy may already hold another stack's ref by
//! then, so [`DockerStackDeployer`] never reads files from it: object
//! contents and env files captured during the cycle are written into a
//! private bundle directory next to the rendered compose file.
//!
//! Relative bind-mount sources are anchored at the compose file's directory
//! in the working copy, since the bundle directory has nothing to mount.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_yaml::Value;

use stackcd_sync::definition::{object_refs, ENV_FILE, SERVICES};
use stackcd_sync::secrets::object_file_path;
use stackcd_sync::{ComposeDefinition, ObjectContent, ObjectKind, ResolvedStack};

use crate::error::{io_err, DaemonError};

const COMPOSE_FILE_NAME: &str = "docker-compose.yaml";
const ENV_FILES_DIR: &str = "env_files";

/// Applies a resolved stack to the orchestration platform.
pub trait Deployer: Send + Sync {
    fn deploy(&self, stack: &ResolvedStack) -> Result<(), DaemonError>;
}

// ---------------------------------------------------------------------------
// docker stack deploy
// ---------------------------------------------------------------------------

/// Shells out to `docker stack deploy`.
#[derive(Debug, Clone)]
pub struct DockerStackDeployer {
    binary: PathBuf,
}

impl DockerStackDeployer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerStackDeployer {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl Deployer for DockerStackDeployer {
    fn deploy(&self, stack: &ResolvedStack) -> Result<(), DaemonError> {
        let bundle = tempfile::Builder::new()
            .prefix("stackcd-")
            .tempdir()
            .map_err(|e| io_err(std::env::temp_dir(), e))?;

        let definition = materialize(stack, bundle.path())?;
        let yaml = definition
            .to_yaml_string()
            .map_err(|e| deploy_err(stack, e))?;
        let compose_file = bundle.path().join(COMPOSE_FILE_NAME);
        fs::write(&compose_file, yaml).map_err(|e| io_err(&compose_file, e))?;

        tracing::info!(
            stack = %stack.stack,
            reference = %stack.reference,
            revision = %stack.revision,
            "deploying stack"
        );
        let output = Command::new(&self.binary)
            .args(deploy_args(stack, &compose_file))
            .output()
            .map_err(|e| deploy_err(stack, format!("failed to run {}: {e}", self.binary.display())))?;
        if !output.status.success() {
            return Err(deploy_err(
                stack,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        tracing::info!(stack = %stack.stack, revision = %stack.revision, "stack deployed");
        Ok(())
    }
}

/// Platform-side stack name: the configured prefix plus the stack name.
pub fn platform_stack_name(stack: &ResolvedStack) -> String {
    format!(
        "{}{}",
        stack.options.name_prefix.as_deref().unwrap_or_default(),
        stack.stack
    )
}

fn deploy_args(stack: &ResolvedStack, compose_file: &Path) -> Vec<OsString> {
    let resolve_image = if stack.options.image_digests {
        "always"
    } else {
        "never"
    };
    vec![
        "stack".into(),
        "deploy".into(),
        "--compose-file".into(),
        compose_file.into(),
        "--prune".into(),
        "--with-registry-auth".into(),
        "--resolve-image".into(),
        resolve_image.into(),
        platform_stack_name(stack).into(),
    ]
}

/// Copy of the definition that only references files under `bundle`, plus
/// absolute bind-mount sources.
fn materialize(stack: &ResolvedStack, bundle: &Path) -> Result<ComposeDefinition, DaemonError> {
    let mut definition = stack.definition.clone();
    place_objects(stack, &mut definition, bundle)?;
    place_env_files(stack, &mut definition, bundle)?;
    anchor_bind_mounts(stack, &mut definition)?;
    Ok(definition)
}

/// Rotated objects land under their versioned name, staged ones under their own.
fn place_objects(
    stack: &ResolvedStack,
    definition: &mut ComposeDefinition,
    bundle: &Path,
) -> Result<(), DaemonError> {
    for kind in [ObjectKind::Secrets, ObjectKind::Configs] {
        let Some(objects) = definition
            .section_mut(kind.as_str())
            .map_err(|e| deploy_err(stack, e))?
        else {
            continue;
        };
        let refs = object_refs(kind.as_str(), objects).map_err(|e| deploy_err(stack, e))?;

        for object in refs {
            if object.external || object.file.is_none() {
                continue;
            }
            let rotated = stack
                .rotated
                .iter()
                .find(|rotated| rotated.kind == kind && rotated.name == object.name)
                .map(|rotated| (rotated.versioned_name.as_str(), &rotated.content));
            let staged = || {
                stack
                    .staged
                    .iter()
                    .find(|staged| staged.kind == kind && staged.name == object.name)
                    .map(|staged| (staged.name.as_str(), &staged.content))
            };
            let Some((file_name, content)) = rotated.or_else(staged) else {
                return Err(deploy_err(
                    stack,
                    format!("{kind} {} was neither rotated nor staged", object.name),
                ));
            };
            let path = write_bundle_file(bundle, kind.as_str(), file_name, content)?;
            if let Some(Value::Mapping(entry)) = objects.get_mut(object.name.as_str()) {
                entry.insert("file".into(), Value::String(path.display().to_string()));
            }
        }
    }
    Ok(())
}

/// Write every staged env file and point its `env_file` entry at the copy.
fn place_env_files(
    stack: &ResolvedStack,
    definition: &mut ComposeDefinition,
    bundle: &Path,
) -> Result<(), DaemonError> {
    if stack.env_files.is_empty() {
        return Ok(());
    }
    let mut placed = Vec::new();
    for (index, staged) in stack.env_files.iter().enumerate() {
        let base = staged
            .file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = write_bundle_file(bundle, ENV_FILES_DIR, &format!("{index}-{base}"), &staged.content)?;
        placed.push((staged.service.as_str(), staged.file.as_path(), path));
    }

    let Some(services) = definition
        .section_mut(SERVICES)
        .map_err(|e| deploy_err(stack, e))?
    else {
        return Ok(());
    };
    for (name, service) in services.iter_mut() {
        let (Some(name), Value::Mapping(service)) = (name.as_str(), service) else {
            continue;
        };
        if let Some(entry) = service.get_mut(ENV_FILE) {
            rewrite_env_file(entry, name, &placed);
        }
    }
    Ok(())
}

fn rewrite_env_file(entry: &mut Value, service: &str, placed: &[(&str, &Path, PathBuf)]) {
    let target = match entry {
        Value::Sequence(items) => {
            for item in items {
                rewrite_env_file(item, service, placed);
            }
            return;
        }
        Value::Mapping(long) => match long.get_mut("path") {
            Some(Value::String(file)) => file,
            _ => return,
        },
        Value::String(file) => file,
        _ => return,
    };
    let copy = placed
        .iter()
        .find(|(owner, file, _)| *owner == service && *file == Path::new(target.as_str()));
    if let Some((_, _, path)) = copy {
        *target = path.display().to_string();
    }
}

/// Make relative bind-mount sources absolute against the compose file's directory.
fn anchor_bind_mounts(stack: &ResolvedStack, definition: &mut ComposeDefinition) -> Result<(), DaemonError> {
    let Some(services) = definition
        .section_mut(SERVICES)
        .map_err(|e| deploy_err(stack, e))?
    else {
        return Ok(());
    };
    let anchor = |source: &str| {
        stack
            .workdir
            .join(object_file_path(&stack.compose_path, Path::new(source)))
            .display()
            .to_string()
    };
    for service in services.values_mut() {
        let Some(Value::Sequence(volumes)) = service.get_mut("volumes") else {
            continue;
        };
        for volume in volumes {
            match volume {
                // `./data:/data[:ro]`; named volumes never start with a dot.
                Value::String(short) if short.starts_with('.') => {
                    if let Some((source, rest)) = short.split_once(':') {
                        *short = format!("{}:{rest}", anchor(source));
                    }
                }
                Value::Mapping(long) => {
                    let bind = long.get("type").and_then(Value::as_str) == Some("bind");
                    if let (true, Some(Value::String(source))) = (bind, long.get_mut("source")) {
                        if Path::new(source.as_str()).is_relative() {
                            *source = anchor(source.as_str());
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn write_bundle_file(
    bundle: &Path,
    dir: &str,
    name: &str,
    content: &ObjectContent,
) -> Result<PathBuf, DaemonError> {
    let dir = bundle.join(dir);
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let path = dir.join(name);
    fs::write(&path, content.as_bytes()).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

fn deploy_err(stack: &ResolvedStack, message: impl fmt::Display) -> DaemonError {
    DaemonError::Deploy {
        stack: stack.stack.clone(),
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// Logs what would be deployed and changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeployer;

impl Deployer for LogDeployer {
    fn deploy(&self, stack: &ResolvedStack) -> Result<(), DaemonError> {
        let services = stack
            .definition
            .service_names()
            .map_err(|e| deploy_err(stack, e))?;
        tracing::info!(
            stack = %platform_stack_name(stack),
            reference = %stack.reference,
            revision = %stack.revision,
            services = ?services,
            objects = ?stack.object_names(),
            "dry run: would deploy stack"
        );
        Ok(())
    }
}
