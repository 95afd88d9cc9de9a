//! Repository synchronizer: one shared working copy per tracked repo.
//!
//! ## Locking
//!
//! The checked-out tree is global mutable state: stacks that share a repo
//! but track different refs would otherwise read each other's files. Every
//! operation goes through [`StackRepo::lock`], which hands out a
//! [`RepoGuard`]. Checkout, fetch/pull, HEAD read and file reads made
//! through one guard form a single critical section. The lock is per repo,
//! so distinct repos synchronize in parallel.
//!
//! ## Branch vs tag
//!
//! Kept as two operations on purpose:
//! - branch: checkout `refs/remotes/origin/<branch>`, fetch the branch,
//!   fast-forward to the fetched tip;
//! - tag: fetch only `+refs/tags/<tag>:refs/tags/<tag>` (forced, so a
//!   re-pushed tag wins), then checkout the tag's commit.
//!
//! Both drop the local copy of the fetched ref first, so a branch or tag
//! deleted upstream fails the sync instead of serving its last revision.
//!
//! Failures are never retried here; the scheduler owns retry cadence.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    AutotagOption, Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, RemoteCallbacks,
    Repository,
};

use stackcd_core::types::{Credential, RepoName};

use crate::error::SyncError;
use crate::revision::Revision;

const ORIGIN: &str = "origin";

/// Message the credential callback fails with once the remote rejects a credential.
const AUTH_REQUIRED: &str = "authentication required";

/// A tracked git repository with its working copy and lock.
pub struct StackRepo {
    name: RepoName,
    url: String,
    path: PathBuf,
    credential: Option<Credential>,
    git: Mutex<Repository>,
}

impl fmt::Debug for StackRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackRepo")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("path", &self.path)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

/// Outcome of the pull step of a branch sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded,
}

impl StackRepo {
    /// Clone `url` into `path`, or open the repository already there.
    pub fn clone_or_open(
        name: impl Into<RepoName>,
        path: impl Into<PathBuf>,
        url: impl Into<String>,
        credential: Option<Credential>,
    ) -> Result<Self, SyncError> {
        let name = name.into();
        let path = path.into();
        let url = url.into();

        let cloned = {
            let mut builder = RepoBuilder::new();
            builder.fetch_options(fetch_options(credential.as_ref()));
            builder.clone(&url, &path)
        };
        let repo = match cloned {
            Ok(repo) => {
                tracing::info!(repo = %name, path = %path.display(), "cloned repo");
                repo
            }
            Err(err) if err.code() == ErrorCode::Exists => {
                tracing::debug!(repo = %name, path = %path.display(), "opening existing repo");
                return Self::open(name, path, url, credential);
            }
            Err(err) if is_auth_failure(&err) => {
                return Err(SyncError::Authentication {
                    repo: name,
                    operation: "cloning".to_string(),
                });
            }
            Err(err) => return Err(SyncError::CloneOrOpen { repo: name, source: err }),
        };

        Ok(Self {
            name,
            url,
            path,
            credential,
            git: Mutex::new(repo),
        })
    }

    /// Open an existing working copy without contacting the remote.
    pub fn open(
        name: impl Into<RepoName>,
        path: impl Into<PathBuf>,
        url: impl Into<String>,
        credential: Option<Credential>,
    ) -> Result<Self, SyncError> {
        let name = name.into();
        let path = path.into();
        let repo = Repository::open(&path).map_err(|e| SyncError::CloneOrOpen {
            repo: name.clone(),
            source: e,
        })?;
        Ok(Self {
            name,
            url: url.into(),
            path,
            credential,
            git: Mutex::new(repo),
        })
    }

    pub fn name(&self) -> &RepoName {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Root of the working copy on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive lock on the working copy.
    ///
    /// Blocks until every other holder is done. A holder that panicked leaves
    /// the tree in an unknown state, which the next forced checkout repairs,
    /// so poisoning is ignored.
    pub fn lock(&self) -> RepoGuard<'_> {
        let git = self
            .git
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        RepoGuard { repo: self, git }
    }

    /// Lock, bring the working copy to `branch`, and return its revision.
    pub fn sync_branch(&self, branch: &str) -> Result<Revision, SyncError> {
        self.lock().sync_branch(branch)
    }

    /// Lock, bring the working copy to `tag`, and return its revision.
    pub fn sync_tag(&self, tag: &str) -> Result<Revision, SyncError> {
        self.lock().sync_tag(tag)
    }
}

/// Exclusive access to a [`StackRepo`]'s working copy.
pub struct RepoGuard<'a> {
    repo: &'a StackRepo,
    git: MutexGuard<'a, Repository>,
}

impl RepoGuard<'_> {
    pub fn name(&self) -> &RepoName {
        &self.repo.name
    }

    pub fn workdir(&self) -> &Path {
        &self.repo.path
    }

    /// Force-checkout the remote-tracking branch, pull it, and read HEAD.
    pub fn sync_branch(&mut self, branch: &str) -> Result<Revision, SyncError> {
        let repo = &self.repo.name;
        let remote_ref = format!("refs/remotes/{ORIGIN}/{branch}");

        // A branch created after the clone has no tracking ref yet; the pull
        // below fetches it and checks it out.
        if self.git.find_reference(&remote_ref).is_ok() {
            tracing::debug!(repo = %repo, branch, "checking out branch");
            force_checkout(&self.git, &remote_ref).map_err(|e| SyncError::Checkout {
                repo: repo.clone(),
                reference: format!("branch {branch}"),
                source: e,
            })?;
        }

        tracing::debug!(repo = %repo, branch, "pulling changes");
        let outcome = self.pull(branch, &remote_ref).map_err(|e| {
            if is_auth_failure(&e) {
                SyncError::Authentication {
                    repo: repo.clone(),
                    operation: format!("pulling branch {branch}"),
                }
            } else {
                SyncError::Pull {
                    repo: repo.clone(),
                    branch: branch.to_string(),
                    source: e,
                }
            }
        })?;

        let revision = self.head_revision(&format!("branch {branch}"))?;
        tracing::debug!(repo = %repo, branch, revision = %revision, outcome = ?outcome, "branch synchronized");
        Ok(revision)
    }

    /// Fetch exactly one tag, force-checkout it, and read HEAD.
    pub fn sync_tag(&mut self, tag: &str) -> Result<Revision, SyncError> {
        let repo = &self.repo.name;
        let tag_ref = format!("refs/tags/{tag}");

        tracing::debug!(repo = %repo, tag, "fetching tag");
        self.fetch_tag(tag).map_err(|e| {
            if is_auth_failure(&e) {
                SyncError::Authentication {
                    repo: repo.clone(),
                    operation: format!("fetching tag {tag}"),
                }
            } else {
                SyncError::Fetch {
                    repo: repo.clone(),
                    tag: tag.to_string(),
                    source: e,
                }
            }
        })?;

        tracing::debug!(repo = %repo, tag, "checking out tag");
        force_checkout(&self.git, &tag_ref).map_err(|e| SyncError::Checkout {
            repo: repo.clone(),
            reference: format!("tag {tag}"),
            source: e,
        })?;

        let revision = self.head_revision(&format!("tag {tag}"))?;
        tracing::debug!(repo = %repo, tag, revision = %revision, "tag synchronized");
        Ok(revision)
    }

    /// Read a file from the working copy, relative to the repository root.
    pub fn read_file(&self, relative: &Path) -> Result<Vec<u8>, SyncError> {
        let path = self.repo.path.join(relative);
        std::fs::read(&path).map_err(|e| SyncError::ReadDefinition {
            repo: self.repo.name.clone(),
            path: relative.to_path_buf(),
            source: e,
        })
    }

    fn pull(&self, branch: &str, remote_ref: &str) -> Result<PullOutcome, git2::Error> {
        let refspec = format!("+refs/heads/{branch}:{remote_ref}");
        let mut remote = self.git.find_remote(ORIGIN)?;
        let mut options = fetch_options(self.repo.credential.as_ref());
        drop_stale_ref(&self.git, remote_ref)?;
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;

        let tip = fetched(&self.git, remote_ref, &format!("refs/heads/{branch}"))?
            .peel_to_commit()?
            .id();
        let head = self.git.head()?.peel_to_commit()?.id();
        if tip == head {
            return Ok(PullOutcome::UpToDate);
        }
        force_checkout(&self.git, remote_ref)?;
        Ok(PullOutcome::FastForwarded)
    }

    fn fetch_tag(&self, tag: &str) -> Result<(), git2::Error> {
        let tag_ref = format!("refs/tags/{tag}");
        let refspec = format!("+{tag_ref}:{tag_ref}");
        let mut remote = self.git.find_remote(ORIGIN)?;
        let mut options = fetch_options(self.repo.credential.as_ref());
        options.download_tags(AutotagOption::None);
        drop_stale_ref(&self.git, &tag_ref)?;
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;
        fetched(&self.git, &tag_ref, &tag_ref)?;
        Ok(())
    }

    fn head_revision(&self, reference: &str) -> Result<Revision, SyncError> {
        let head = self
            .git
            .head()
            .and_then(|head| head.peel_to_commit())
            .map_err(|e| SyncError::HeadResolution {
                repo: self.repo.name.clone(),
                reference: reference.to_string(),
                source: e,
            })?;
        Ok(Revision::from_oid(head.id()))
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Point the tree and a detached HEAD at `refname`'s commit, discarding local edits.
fn force_checkout(git: &Repository, refname: &str) -> Result<(), git2::Error> {
    let commit = git.find_reference(refname)?.peel_to_commit()?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    git.checkout_tree(commit.as_object(), Some(&mut checkout))?;
    git.set_head_detached(commit.id())
}

/// Delete `refname` before fetching it again.
///
/// A refspec whose source the remote no longer advertises fetches nothing
/// without error, so a ref left over from an earlier sync would keep
/// resolving after the branch or tag was deleted upstream.
fn drop_stale_ref(git: &Repository, refname: &str) -> Result<(), git2::Error> {
    match git.find_reference(refname) {
        Ok(mut stale) => stale.delete(),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// The local ref a fetch of `source` should have written.
fn fetched<'r>(
    git: &'r Repository,
    refname: &str,
    source: &str,
) -> Result<git2::Reference<'r>, git2::Error> {
    git.find_reference(refname).map_err(|err| {
        if err.code() == ErrorCode::NotFound {
            git2::Error::new(
                ErrorCode::NotFound,
                ErrorClass::Reference,
                format!("couldn't find remote ref {source}"),
            )
        } else {
            err
        }
    })
}

/// Fetch options carrying the basic-auth credential.
///
/// The credential is offered once; libgit2 asks again when the remote
/// rejects it, and answering the same thing would loop.
fn fetch_options(credential: Option<&Credential>) -> FetchOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(credential) = credential {
        let mut offered = false;
        callbacks.credentials(move |_url, _username, allowed| {
            if offered || !allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
                return Err(git2::Error::from_str(AUTH_REQUIRED));
            }
            offered = true;
            Cred::userpass_plaintext(&credential.username, &credential.password)
        });
    }
    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

/// Whether a transport error means the remote refused our (lack of) credentials.
fn is_auth_failure(err: &git2::Error) -> bool {
    if err.code() == ErrorCode::Auth {
        return true;
    }
    let message = err.message().to_ascii_lowercase();
    message.contains(AUTH_REQUIRED) || message.contains("authentication replays")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_code_is_auth_failure() {
        let err = git2::Error::new(ErrorCode::Auth, git2::ErrorClass::Http, "denied");
        assert!(is_auth_failure(&err));
    }

    #[test]
    fn generic_authentication_required_message_is_auth_failure() {
        let err = git2::Error::from_str("authentication required");
        assert!(is_auth_failure(&err));
        let err = git2::Error::new(
            ErrorCode::GenericError,
            git2::ErrorClass::Http,
            "remote authentication required but no callback set",
        );
        assert!(is_auth_failure(&err));
    }

    #[test]
    fn other_errors_are_not_auth_failures() {
        let err = git2::Error::new(
            ErrorCode::NotFound,
            git2::ErrorClass::Reference,
            "reference 'refs/remotes/origin/nope' not found",
        );
        assert!(!is_auth_failure(&err));
    }

    #[test]
    fn clone_of_missing_remote_is_clone_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = StackRepo::clone_or_open(
            "ghost",
            tmp.path().join("checkout"),
            tmp.path().join("no-such-remote").display().to_string(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::CloneOrOpen { .. }), "got: {err}");
        assert!(err.to_string().contains("ghost"));
    }
}
