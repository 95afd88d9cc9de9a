//! # stackcd-sync
//!
//! Repository synchronization and stack reconciliation.
//!
//! - [`repo`] — one locked working copy per git repository
//! - [`definition`] — the parsed compose document
//! - [`secrets`] — secret file discovery
//! - [`template`] — compose files rendered against a values file
//! - [`rotation`] — content-addressed secret/config names
//! - [`staging`] — referenced files copied out under the lock
//! - [`stack`] — one reconciliation cycle per stack
//!
//! Call [`Stack::reconcile`] to resolve a stack to a [`ResolvedStack`].

pub mod definition;
pub mod error;
pub mod repo;
pub mod revision;
pub mod rotation;
pub mod secrets;
pub mod stack;
pub mod staging;
pub mod template;

pub use definition::{ComposeDefinition, DefinitionError, EnvFileRef, ObjectRef};
pub use error::SyncError;
pub use repo::{RepoGuard, StackRepo};
pub use revision::Revision;
pub use rotation::{
    DecryptError, Decryptor, EncryptedFiles, ObjectContent, ObjectKind, PlainText, RotatedObject, RotationError,
    RotationStatus, SopsDecryptor,
};
pub use secrets::discover_secrets;
pub use stack::{CycleError, CycleStage, ResolvedStack, Stack, StackRef};
pub use staging::{StagedFile, StagedObject};
pub use template::TemplateError;
