//! Content-addressed rotation of swarm secrets and configs.
//!
//! Swarm objects are immutable: a changed secret must be created under a new
//! name and the stack pointed at it. Each managed entry gets the platform
//! name `<entry>-<first 8 hex of sha256(plaintext)>`, so identical content
//! always maps to the same object and unchanged content never triggers a
//! redeploy.
//!
//! ## Two phases
//!
//! 1. [`plan`] recovers every entry's plaintext and computes its digest
//!    without touching the document.
//! 2. [`RotationPlan::commit`] writes the `name:` attributes.
//!
//! A failure in phase 1 leaves the document as it was, so a stack never
//! references a mix of old and new object versions.
//!
//! Entries marked `external` are skipped outright: no read, no digest, no write.
//! Only files named by [`EncryptedFiles`] go through the [`Decryptor`]; the
//! rest are digested as they are stored.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::definition::{object_refs, DefinitionError, ObjectRef, CONFIGS, SECRETS};
use crate::secrets::repo_file_path;

/// Hex characters of the digest appended to an object name.
const NAME_DIGEST_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Object kinds
// ---------------------------------------------------------------------------

/// The two managed-object categories of a compose stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Secrets,
    Configs,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Secrets => SECRETS,
            ObjectKind::Configs => CONFIGS,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = RotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            SECRETS => Ok(ObjectKind::Secrets),
            CONFIGS => Ok(ObjectKind::Configs),
            other => Err(RotationError::UnknownKind(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Decryption backend
// ---------------------------------------------------------------------------

/// Failure to recover an object's plaintext.
#[derive(Debug, Error)]
#[error("could not decrypt {path}: {message}")]
pub struct DecryptError {
    pub path: PathBuf,
    pub message: String,
}

/// Recovers the plaintext of an object file.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, path: &Path) -> Result<Vec<u8>, DecryptError>;
}

/// Reads files verbatim. Used for configs, and for secrets stored unencrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl Decryptor for PlainText {
    fn decrypt(&self, path: &Path) -> Result<Vec<u8>, DecryptError> {
        std::fs::read(path).map_err(|e| DecryptError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Decrypts with the `sops` CLI (`sops --decrypt <file>`).
#[derive(Debug, Clone)]
pub struct SopsDecryptor {
    binary: PathBuf,
}

impl SopsDecryptor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for SopsDecryptor {
    fn default() -> Self {
        Self::new("sops")
    }
}

impl Decryptor for SopsDecryptor {
    fn decrypt(&self, path: &Path) -> Result<Vec<u8>, DecryptError> {
        let output = Command::new(&self.binary)
            .arg("--decrypt")
            .arg(path)
            .output()
            .map_err(|e| DecryptError {
                path: path.to_path_buf(),
                message: format!("failed to run {}: {e}", self.binary.display()),
            })?;
        if !output.status.success() {
            return Err(DecryptError {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Which object files hold ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFiles {
    /// Every file-backed secret.
    pub all_secrets: bool,
    /// Further files, relative to the repository root and normalized.
    pub files: Vec<PathBuf>,
}

impl EncryptedFiles {
    /// `file` is relative to the repository root.
    pub fn contains(&self, kind: ObjectKind, file: &Path) -> bool {
        (self.all_secrets && kind == ObjectKind::Secrets) || self.files.iter().any(|f| f == file)
    }
}

impl Default for EncryptedFiles {
    fn default() -> Self {
        Self {
            all_secrets: true,
            files: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

/// Why a rotation aborted. Carries the responsible object name where there is one.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("unknown object kind '{0}'; expected secrets or configs")]
    UnknownKind(String),

    #[error("object {object}: {source}")]
    Decrypt {
        object: String,
        #[source]
        source: DecryptError,
    },

    #[error(transparent)]
    Shape(#[from] DefinitionError),
}

/// Whether an object's platform name moved this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStatus {
    /// New content: a new versioned object must be created.
    Rotated,
    /// The document already named this exact version.
    Unchanged,
}

/// Recovered plaintext of an object. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectContent(Vec<u8>);

impl ObjectContent {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ObjectContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ObjectContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectContent(<{} bytes>)", self.0.len())
    }
}

/// Result of rotating one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedObject {
    pub kind: ObjectKind,
    pub name: String,
    pub versioned_name: String,
    /// Full hex SHA-256 of the plaintext.
    pub digest: String,
    pub status: RotationStatus,
    pub content: ObjectContent,
}

/// Computed but not yet applied rotation of one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPlan {
    kind: ObjectKind,
    objects: Vec<RotatedObject>,
}

impl RotationPlan {
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn objects(&self) -> &[RotatedObject] {
        &self.objects
    }

    /// Point every planned entry at its versioned name.
    pub fn commit(self, objects: &mut Mapping) -> Vec<RotatedObject> {
        for object in &self.objects {
            let Some(slot) = objects.get_mut(object.name.as_str()) else {
                continue;
            };
            // `name:` with no body parses as null.
            if !slot.is_mapping() {
                *slot = Value::Mapping(Mapping::new());
            }
            if let Value::Mapping(entry) = slot {
                entry.insert(
                    Value::String("name".to_string()),
                    Value::String(object.versioned_name.clone()),
                );
            }
        }
        self.objects
    }
}

/// Non-external entries of `objects` that carry a `file`, each paired with
/// that file relative to the repository root.
pub(crate) fn managed_objects(
    objects: &Mapping,
    kind: ObjectKind,
    definition_path: &Path,
) -> Result<Vec<(ObjectRef, PathBuf)>, DefinitionError> {
    let mut managed = Vec::new();
    for object in object_refs(kind.as_str(), objects)? {
        if object.external {
            tracing::debug!(kind = %kind, object = %object.name, "skipping external object");
            continue;
        }
        let Some(file) = object.file.as_deref() else {
            continue;
        };
        let file = repo_file_path(kind.as_str(), &object.name, definition_path, file)?;
        managed.push((object, file));
    }
    Ok(managed)
}

/// Phase 1: recover and digest every managed entry of `objects`.
///
/// `definition_path` is the compose file's path relative to `workdir`; object
/// files resolve against its directory. Files named by `encrypted` go through
/// `decryptor`, everything else is read as-is. Entries without `file` have
/// nothing to rotate.
pub fn plan(
    objects: &Mapping,
    kind: ObjectKind,
    workdir: &Path,
    definition_path: &Path,
    decryptor: &dyn Decryptor,
    encrypted: &EncryptedFiles,
) -> Result<RotationPlan, RotationError> {
    let mut planned = Vec::new();
    for (object, file) in managed_objects(objects, kind, definition_path)? {
        let recover: &dyn Decryptor = if encrypted.contains(kind, &file) {
            decryptor
        } else {
            &PlainText
        };
        let plaintext = recover
            .decrypt(&workdir.join(&file))
            .map_err(|source| RotationError::Decrypt {
                object: object.name.clone(),
                source,
            })?;

        let digest = hex::encode(Sha256::digest(&plaintext));
        let versioned_name = format!("{}-{}", object.name, &digest[..NAME_DIGEST_LEN]);
        let status = if object.platform_name.as_deref() == Some(versioned_name.as_str()) {
            RotationStatus::Unchanged
        } else {
            RotationStatus::Rotated
        };
        tracing::debug!(
            kind = %kind,
            object = %object.name,
            versioned_name = %versioned_name,
            status = ?status,
            "planned rotation"
        );
        planned.push(RotatedObject {
            kind,
            name: object.name,
            versioned_name,
            digest,
            status,
            content: ObjectContent(plaintext),
        });
    }
    Ok(RotationPlan {
        kind,
        objects: planned,
    })
}

/// Plan and commit in one step.
pub fn rotate_objects(
    objects: &mut Mapping,
    kind: ObjectKind,
    workdir: &Path,
    definition_path: &Path,
    decryptor: &dyn Decryptor,
    encrypted: &EncryptedFiles,
) -> Result<Vec<RotatedObject>, RotationError> {
    let plan = plan(objects, kind, workdir, definition_path, decryptor, encrypted)?;
    Ok(plan.commit(objects))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts calls and returns the file contents reversed.
    #[derive(Default)]
    struct CountingDecryptor {
        calls: AtomicUsize,
    }

    impl Decryptor for CountingDecryptor {
        fn decrypt(&self, path: &Path) -> Result<Vec<u8>, DecryptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut bytes = PlainText.decrypt(path)?;
            bytes.reverse();
            Ok(bytes)
        }
    }

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn sha_prefix(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))[..8].to_string()
    }

    fn workdir_with(files: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (path, content) in files {
            let full = tmp.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        tmp
    }

    #[test]
    fn external_objects_are_untouched_for_both_kinds() {
        for kind in [ObjectKind::Secrets, ObjectKind::Configs] {
            let tmp = TempDir::new().unwrap();
            let decryptor = CountingDecryptor::default();
            let mut objects = mapping("my-object:\n  external: true\n");
            let before = objects.clone();

            let rotated = rotate_objects(
                &mut objects,
                kind,
                tmp.path(),
                Path::new("docker-compose.yaml"),
                &decryptor,
                &EncryptedFiles::default(),
            )
            .unwrap();

            assert!(rotated.is_empty(), "{kind}: nothing rotated");
            assert_eq!(decryptor.calls.load(Ordering::SeqCst), 0, "{kind}: no decrypt");
            assert_eq!(objects, before, "{kind}: reference unchanged");
        }
    }

    #[test]
    fn secret_is_renamed_to_digest_of_decrypted_content() {
        let tmp = workdir_with(&[("stacks/secrets/db.txt", "abc")]);
        let decryptor = CountingDecryptor::default();
        let mut objects = mapping("db:\n  file: secrets/db.txt\n");

        let rotated = rotate_objects(
            &mut objects,
            ObjectKind::Secrets,
            tmp.path(),
            Path::new("stacks/compose.yaml"),
            &decryptor,
            &EncryptedFiles::default(),
        )
        .unwrap();

        let expected = format!("db-{}", sha_prefix(b"cba"));
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].versioned_name, expected);
        assert_eq!(rotated[0].status, RotationStatus::Rotated);
        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(objects["db"]["name"].as_str(), Some(expected.as_str()));
    }

    #[test]
    fn configs_bypass_the_decryptor() {
        let tmp = workdir_with(&[("nginx.conf", "worker_processes 1;")]);
        let decryptor = CountingDecryptor::default();
        let mut objects = mapping("nginx:\n  file: nginx.conf\n");

        let rotated = rotate_objects(
            &mut objects,
            ObjectKind::Configs,
            tmp.path(),
            Path::new("compose.yaml"),
            &decryptor,
            &EncryptedFiles::default(),
        )
        .unwrap();

        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            rotated[0].versioned_name,
            format!("nginx-{}", sha_prefix(b"worker_processes 1;"))
        );
    }

    #[test]
    fn listed_config_goes_through_the_decryptor() {
        let tmp = workdir_with(&[("stacks/app.enc.json", "{}")]);
        let decryptor = CountingDecryptor::default();
        let mut objects = mapping("app:\n  file: app.enc.json\n");
        let encrypted = EncryptedFiles {
            all_secrets: true,
            files: vec![PathBuf::from("stacks/app.enc.json")],
        };

        rotate_objects(
            &mut objects,
            ObjectKind::Configs,
            tmp.path(),
            Path::new("stacks/compose.yaml"),
            &decryptor,
            &encrypted,
        )
        .unwrap();

        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unlisted_secret_is_read_verbatim_without_discovery() {
        let tmp = workdir_with(&[("plain.txt", "abc"), ("sealed.txt", "xyz")]);
        let decryptor = CountingDecryptor::default();
        let mut objects = mapping("plain:\n  file: plain.txt\nsealed:\n  file: sealed.txt\n");
        let encrypted = EncryptedFiles {
            all_secrets: false,
            files: vec![PathBuf::from("sealed.txt")],
        };

        let rotated = rotate_objects(
            &mut objects,
            ObjectKind::Secrets,
            tmp.path(),
            Path::new("compose.yaml"),
            &decryptor,
            &encrypted,
        )
        .unwrap();

        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rotated[0].versioned_name, format!("plain-{}", sha_prefix(b"abc")));
        assert_eq!(rotated[1].versioned_name, format!("sealed-{}", sha_prefix(b"zyx")));
    }

    #[test]
    fn object_file_outside_the_repository_is_refused() {
        let tmp = TempDir::new().unwrap();
        let decryptor = CountingDecryptor::default();
        let mut objects = mapping("host:\n  file: /etc/hostname\n");
        let before = objects.clone();

        let err = rotate_objects(
            &mut objects,
            ObjectKind::Configs,
            tmp.path(),
            Path::new("compose.yaml"),
            &decryptor,
            &EncryptedFiles::default(),
        )
        .unwrap_err();

        assert!(matches!(err, RotationError::Shape(DefinitionError::OutsideRepository { .. })), "got: {err}");
        assert_eq!(decryptor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(objects, before);
    }

    #[test]
    fn rotation_is_idempotent() {
        let tmp = workdir_with(&[("a.txt", "same")]);
        let mut objects = mapping("a:\n  file: a.txt\n");
        let path = Path::new("compose.yaml");
        let all = EncryptedFiles::default();

        let first = rotate_objects(&mut objects, ObjectKind::Secrets, tmp.path(), path, &PlainText, &all)
            .unwrap();
        let after_first = objects.clone();
        let second = rotate_objects(&mut objects, ObjectKind::Secrets, tmp.path(), path, &PlainText, &all)
            .unwrap();

        assert_eq!(first[0].status, RotationStatus::Rotated);
        assert_eq!(second[0].status, RotationStatus::Unchanged);
        assert_eq!(first[0].versioned_name, second[0].versioned_name);
        assert_eq!(objects, after_first);
    }

    #[test]
    fn failure_on_one_object_applies_nothing() {
        let tmp = workdir_with(&[("ok.txt", "fine")]);
        let mut objects = mapping("ok:\n  file: ok.txt\nbroken:\n  file: missing.txt\n");
        let before = objects.clone();

        let err = rotate_objects(
            &mut objects,
            ObjectKind::Secrets,
            tmp.path(),
            Path::new("compose.yaml"),
            &PlainText,
            &EncryptedFiles::default(),
        )
        .unwrap_err();

        assert!(matches!(&err, RotationError::Decrypt { object, .. } if object == "broken"));
        assert_eq!(objects, before, "no partial rename");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "volumes".parse::<ObjectKind>().unwrap_err();
        assert!(err.to_string().contains("unknown object kind 'volumes'"));
        assert_eq!("configs".parse::<ObjectKind>().unwrap(), ObjectKind::Configs);
    }

    #[test]
    fn null_entry_without_file_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let mut objects = mapping("token:\n");
        let rotated = rotate_objects(
            &mut objects,
            ObjectKind::Secrets,
            tmp.path(),
            Path::new("compose.yaml"),
            &PlainText,
            &EncryptedFiles::default(),
        )
        .unwrap();
        assert!(rotated.is_empty());
        assert_eq!(objects["token"], Value::Null);
    }

    #[test]
    fn content_is_redacted_in_debug_output() {
        let tmp = workdir_with(&[("token.txt", "s3cr3t")]);
        let mut objects = mapping("token:\n  file: token.txt\n");
        let rotated = rotate_objects(
            &mut objects,
            ObjectKind::Secrets,
            tmp.path(),
            Path::new("compose.yaml"),
            &PlainText,
            &EncryptedFiles::default(),
        )
        .unwrap();
        assert_eq!(rotated[0].content.as_bytes(), b"s3cr3t");
        let debug = format!("{:?}", rotated[0]);
        assert!(!debug.contains("s3cr3t"), "got: {debug}");
        assert!(debug.contains("<6 bytes>"));
    }

    #[test]
    fn sops_decryptor_reports_missing_binary() {
        let decryptor = SopsDecryptor::new("/nonexistent/sops-binary");
        let err = decryptor.decrypt(Path::new("secret.yaml")).unwrap_err();
        assert!(err.message.contains("failed to run"), "got: {err}");
    }
}
