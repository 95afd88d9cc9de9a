//! Stack reconciler: resolves one stack to a parsed, rotated definition.
//!
//! A cycle walks `Idle → Synchronizing → Rendering → Parsing →
//! DiscoveringSecrets → Rotating → Staging → Resolved`. Rendering runs only
//! with a values file, discovery and rotation only when enabled. Any stage
//! may fail; the error names the stage and nothing is carried over to the
//! next cycle. Everything that touches the working copy happens under one
//! [`RepoGuard`], so a stack never reads files from a ref another stack
//! checked out.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::Mapping;
use thiserror::Error;

use stackcd_core::types::{StackConfig, StackName, StackOptions};

use crate::definition::ComposeDefinition;
use crate::error::SyncError;
use crate::repo::{RepoGuard, StackRepo};
use crate::revision::Revision;
use crate::rotation::{
    self, Decryptor, EncryptedFiles, ObjectKind, PlainText, RotatedObject, RotationError,
};
use crate::secrets;
use crate::staging::{self, StagedFile, StagedObject};
use crate::template::{self, TemplateError};

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// The ref a stack resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StackRef {
    Branch(String),
    Tag(String),
}

impl StackRef {
    /// `"branch"` or `"tag"`.
    pub fn key(&self) -> &'static str {
        match self {
            StackRef::Branch(_) => "branch",
            StackRef::Tag(_) => "tag",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            StackRef::Branch(v) | StackRef::Tag(v) => v,
        }
    }
}

impl fmt::Display for StackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key(), self.value())
    }
}

// ---------------------------------------------------------------------------
// Cycle state
// ---------------------------------------------------------------------------

/// Where a reconciliation cycle is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Idle,
    Synchronizing,
    Rendering,
    Parsing,
    DiscoveringSecrets,
    Rotating,
    Staging,
    Resolved,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CycleStage::Idle => "idle",
            CycleStage::Synchronizing => "synchronizing",
            CycleStage::Rendering => "rendering",
            CycleStage::Parsing => "parsing",
            CycleStage::DiscoveringSecrets => "discovering secrets",
            CycleStage::Rotating => "rotating",
            CycleStage::Staging => "staging files",
            CycleStage::Resolved => "resolved",
        })
    }
}

/// A failed cycle: the stack, the stage it failed in, and why.
#[derive(Debug, Error)]
#[error("stack {stack} failed while {stage}: {source}")]
pub struct CycleError {
    pub stack: StackName,
    pub stage: CycleStage,
    #[source]
    pub source: SyncError,
}

/// Output of a successful cycle, handed to the deployer.
#[derive(Debug, Clone)]
pub struct ResolvedStack {
    pub stack: StackName,
    pub reference: StackRef,
    pub revision: Revision,
    /// Root of the working copy the definition was read from.
    pub workdir: PathBuf,
    /// Relative to the repository root.
    pub compose_path: PathBuf,
    /// With rotated `name:` attributes applied.
    pub definition: ComposeDefinition,
    /// Declared sops files first, then discovered secrets.
    pub secret_files: Vec<PathBuf>,
    pub rotated: Vec<RotatedObject>,
    /// Managed objects that were not rotated, as read under the lock.
    pub staged: Vec<StagedObject>,
    pub env_files: Vec<StagedFile>,
    pub options: StackOptions,
}

impl ResolvedStack {
    /// Versioned names of every rotated object, in rotation order.
    pub fn object_names(&self) -> Vec<String> {
        self.rotated
            .iter()
            .map(|object| object.versioned_name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// One managed stack on a shared repository.
pub struct Stack {
    name: StackName,
    repo: Arc<StackRepo>,
    branch: String,
    tag: String,
    compose_path: PathBuf,
    options: StackOptions,
    sops_files: Vec<PathBuf>,
    values_file: Option<PathBuf>,
    secret_discovery: bool,
    decryptor: Arc<dyn Decryptor>,
    auto_rotate: bool,
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name)
            .field("repo", self.repo.name())
            .field("branch", &self.branch)
            .field("tag", &self.tag)
            .field("compose_path", &self.compose_path)
            .field("options", &self.options)
            .field("sops_files", &self.sops_files)
            .field("values_file", &self.values_file)
            .field("secret_discovery", &self.secret_discovery)
            .field("auto_rotate", &self.auto_rotate)
            .finish_non_exhaustive()
    }
}

impl Stack {
    /// Branch and tag are stored verbatim; when both are set the tag wins.
    pub fn new(
        name: impl Into<StackName>,
        repo: Arc<StackRepo>,
        branch: impl Into<String>,
        tag: impl Into<String>,
        compose_path: impl Into<PathBuf>,
        options: StackOptions,
    ) -> Self {
        Self {
            name: name.into(),
            repo,
            branch: branch.into(),
            tag: tag.into(),
            compose_path: compose_path.into(),
            options,
            sops_files: Vec::new(),
            values_file: None,
            secret_discovery: true,
            decryptor: Arc::new(PlainText),
            auto_rotate: true,
        }
    }

    pub fn from_config(name: StackName, config: &StackConfig, repo: Arc<StackRepo>) -> Self {
        let stack = Self::new(
            name,
            repo,
            config.branch.clone(),
            config.tag.clone(),
            config.compose_file.clone(),
            config.options.clone(),
        )
        .with_sops_files(config.sops_files.iter().cloned())
        .with_secret_discovery(config.discover_secrets);
        match &config.values_file {
            Some(values) => stack.with_values_file(values.clone()),
            None => stack,
        }
    }

    /// Files, relative to the repository root, that always go through the decryptor.
    pub fn with_sops_files<P: Into<PathBuf>>(mut self, files: impl IntoIterator<Item = P>) -> Self {
        self.sops_files = files
            .into_iter()
            .map(|file| {
                let file: PathBuf = file.into();
                secrets::normalize(&file)
            })
            .collect();
        self
    }

    /// Render the compose file as a template with this file's contents as `values`.
    pub fn with_values_file(mut self, values: impl Into<PathBuf>) -> Self {
        let values: PathBuf = values.into();
        self.values_file = Some(secrets::normalize(&values));
        self
    }

    /// Whether secrets are found by reading the definition. When off, only
    /// [`Stack::with_sops_files`] entries are decrypted.
    pub fn with_secret_discovery(mut self, enabled: bool) -> Self {
        self.secret_discovery = enabled;
        self
    }

    /// Backend used to recover secret plaintext.
    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    /// Whether cycles rotate secrets and configs.
    pub fn with_rotation(mut self, enabled: bool) -> Self {
        self.auto_rotate = enabled;
        self
    }

    pub fn name(&self) -> &StackName {
        &self.name
    }

    pub fn repo(&self) -> &Arc<StackRepo> {
        &self.repo
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn compose_path(&self) -> &Path {
        &self.compose_path
    }

    pub fn options(&self) -> &StackOptions {
        &self.options
    }

    pub fn sops_files(&self) -> &[PathBuf] {
        &self.sops_files
    }

    pub fn values_file(&self) -> Option<&Path> {
        self.values_file.as_deref()
    }

    pub fn secret_discovery(&self) -> bool {
        self.secret_discovery
    }

    /// The ref this stack resolves to: the tag when set, the branch otherwise.
    pub fn reference(&self) -> StackRef {
        if self.tag.is_empty() {
            StackRef::Branch(self.branch.clone())
        } else {
            StackRef::Tag(self.tag.clone())
        }
    }

    /// `("tag", tag)` when a tag is set, `("branch", branch)` otherwise.
    pub fn ref_attr(&self) -> (&'static str, &str) {
        if self.tag.is_empty() {
            ("branch", self.branch.as_str())
        } else {
            ("tag", self.tag.as_str())
        }
    }

    /// Synchronize the repository, render and parse this stack's definition.
    pub fn refresh(&self) -> Result<(Revision, ComposeDefinition), SyncError> {
        let mut guard = self.repo.lock();
        let (revision, mut bytes) = self.refresh_locked(&mut guard)?;
        if self.values_file.is_some() {
            bytes = self.render_locked(&guard, &bytes)?;
        }
        drop(guard);
        let definition = self.parse_definition(&bytes)?;
        Ok((revision, definition))
    }

    pub fn parse_definition(&self, bytes: &[u8]) -> Result<ComposeDefinition, SyncError> {
        ComposeDefinition::from_slice(bytes).map_err(|source| SyncError::Parse {
            path: self.compose_path.clone(),
            source,
        })
    }

    /// Secret files referenced by `definition`, relative to the repository root.
    pub fn discover_secrets(&self, definition: &ComposeDefinition) -> Result<Vec<PathBuf>, SyncError> {
        secrets::discover_secrets(definition, &self.compose_path)
    }

    /// Object files whose stored bytes are ciphertext.
    pub fn encrypted_files(&self) -> EncryptedFiles {
        EncryptedFiles {
            all_secrets: self.secret_discovery,
            files: self.sops_files.clone(),
        }
    }

    /// Rotate one `secrets` or `configs` mapping in place.
    ///
    /// Takes the guard so object files are read from the tree this stack
    /// just synchronized.
    pub fn rotate_objects(
        &self,
        guard: &RepoGuard<'_>,
        objects: &mut Mapping,
        kind: &str,
    ) -> Result<Vec<RotatedObject>, SyncError> {
        let rotation_err = |source| SyncError::Rotation {
            kind: kind.to_string(),
            source,
        };
        let kind: ObjectKind = kind.parse().map_err(rotation_err)?;
        rotation::rotate_objects(
            objects,
            kind,
            guard.workdir(),
            &self.compose_path,
            self.decryptor.as_ref(),
            &self.encrypted_files(),
        )
        .map_err(rotation_err)
    }

    /// Run one full cycle.
    pub fn reconcile(&self) -> Result<ResolvedStack, CycleError> {
        let mut stage = CycleStage::Idle;
        self.run_cycle(&mut stage).map_err(|source| CycleError {
            stack: self.name.clone(),
            stage,
            source,
        })
    }

    fn run_cycle(&self, stage: &mut CycleStage) -> Result<ResolvedStack, SyncError> {
        let reference = self.reference();
        let mut guard = self.repo.lock();

        self.enter(stage, CycleStage::Synchronizing);
        let (revision, mut bytes) = self.refresh_locked(&mut guard)?;

        if self.values_file.is_some() {
            self.enter(stage, CycleStage::Rendering);
            bytes = self.render_locked(&guard, &bytes)?;
        }

        self.enter(stage, CycleStage::Parsing);
        let mut definition = self.parse_definition(&bytes)?;

        let mut secret_files = self.sops_files.clone();
        if self.secret_discovery {
            self.enter(stage, CycleStage::DiscoveringSecrets);
            for file in self.discover_secrets(&definition)? {
                if !secret_files.contains(&file) {
                    secret_files.push(file);
                }
            }
        }

        let rotated = if self.auto_rotate {
            self.enter(stage, CycleStage::Rotating);
            self.rotate_definition(&guard, &mut definition)?
        } else {
            Vec::new()
        };

        self.enter(stage, CycleStage::Staging);
        let workdir = guard.workdir().to_path_buf();
        let staged = staging::stage_objects(&definition, &workdir, &self.compose_path, &rotated)?;
        let env_files = staging::stage_env_files(&definition, &workdir, &self.compose_path)?;
        drop(guard);

        self.enter(stage, CycleStage::Resolved);
        tracing::info!(
            stack = %self.name,
            reference = %reference,
            revision = %revision,
            secrets = secret_files.len(),
            rotated = rotated.len(),
            staged = staged.len() + env_files.len(),
            "stack resolved"
        );
        Ok(ResolvedStack {
            stack: self.name.clone(),
            reference,
            revision,
            workdir,
            compose_path: self.compose_path.clone(),
            definition,
            secret_files,
            rotated,
            staged,
            env_files,
            options: self.options.clone(),
        })
    }

    fn enter(&self, stage: &mut CycleStage, next: CycleStage) {
        tracing::trace!(stack = %self.name, from = %stage, to = %next, "cycle stage");
        *stage = next;
    }

    /// Sync to this stack's ref and read the definition, all under `guard`.
    fn refresh_locked(&self, guard: &mut RepoGuard<'_>) -> Result<(Revision, Vec<u8>), SyncError> {
        let revision = match self.reference() {
            StackRef::Tag(tag) => guard.sync_tag(&tag)?,
            StackRef::Branch(branch) => guard.sync_branch(&branch)?,
        };
        let bytes = guard.read_file(&self.compose_path)?;
        Ok((revision, bytes))
    }

    /// Render the compose template with the values file, under `guard`.
    fn render_locked(&self, guard: &RepoGuard<'_>, template: &[u8]) -> Result<Vec<u8>, SyncError> {
        let Some(values) = self.values_file.as_deref() else {
            return Ok(template.to_vec());
        };
        let render_err = |source| SyncError::Render {
            path: self.compose_path.clone(),
            values: values.to_path_buf(),
            source,
        };
        let recover: &dyn Decryptor = if self.sops_files.iter().any(|f| f == values) {
            self.decryptor.as_ref()
        } else {
            &PlainText
        };
        let bytes = recover
            .decrypt(&guard.workdir().join(values))
            .map_err(|e| render_err(TemplateError::from(e)))?;
        template::render(template, &bytes).map_err(render_err)
    }

    /// Plan both sections before committing either.
    fn rotate_definition(
        &self,
        guard: &RepoGuard<'_>,
        definition: &mut ComposeDefinition,
    ) -> Result<Vec<RotatedObject>, SyncError> {
        let encrypted = self.encrypted_files();
        let mut plans = Vec::new();
        for kind in [ObjectKind::Secrets, ObjectKind::Configs] {
            let rotation_err = |source: RotationError| SyncError::Rotation {
                kind: kind.to_string(),
                source,
            };
            let section = definition
                .section(kind.as_str())
                .map_err(|e| rotation_err(e.into()))?;
            if let Some(objects) = section {
                let plan = rotation::plan(
                    objects,
                    kind,
                    guard.workdir(),
                    &self.compose_path,
                    self.decryptor.as_ref(),
                    &encrypted,
                )
                .map_err(rotation_err)?;
                plans.push(plan);
            }
        }

        let mut rotated = Vec::new();
        for plan in plans {
            if let Ok(Some(objects)) = definition.section_mut(plan.kind().as_str()) {
                rotated.extend(plan.commit(objects));
            }
        }
        Ok(rotated)
    }
}
