mod common;

use stackcd_core::types::Credential;
use stackcd_sync::{StackRepo, SyncError};
use tempfile::TempDir;

use common::{unauthorized_remote, Remote};

fn deploy_token() -> Option<Credential> {
    Some(Credential::new("deploy", "expired-token"))
}

#[test]
fn rejected_credential_on_clone_is_an_authentication_error() {
    let url = unauthorized_remote();
    let work = TempDir::new().unwrap();

    let err = StackRepo::clone_or_open("infra", work.path().join("infra"), url, deploy_token())
        .unwrap_err();

    assert!(
        matches!(err, SyncError::Authentication { ref operation, .. } if operation == "cloning"),
        "got: {err}"
    );
    assert_eq!(
        err.to_string(),
        "authentication failed for repo infra while cloning"
    );
}

#[test]
fn missing_credential_on_clone_is_an_authentication_error() {
    let url = unauthorized_remote();
    let work = TempDir::new().unwrap();

    let err = StackRepo::clone_or_open("infra", work.path().join("infra"), url, None).unwrap_err();

    assert!(matches!(err, SyncError::Authentication { .. }), "got: {err}");
}

/// A working copy cloned locally whose `origin` then moves behind auth.
fn repo_behind_auth(work: &TempDir) -> StackRepo {
    let remote = Remote::new();
    let head = remote.commit("main", &[("app.txt", "v1")]);
    remote.tag("v1.0.0", head);
    let path = work.path().join("infra");
    drop(StackRepo::clone_or_open("infra", &path, remote.url(), None).expect("clone"));

    git2::Repository::open(&path)
        .unwrap()
        .remote_set_url("origin", &unauthorized_remote())
        .unwrap();
    StackRepo::open("infra", &path, "unused", deploy_token()).expect("open")
}

#[test]
fn rejected_credential_on_pull_is_an_authentication_error() {
    let work = TempDir::new().unwrap();
    let repo = repo_behind_auth(&work);

    let err = repo.sync_branch("main").unwrap_err();

    assert!(
        matches!(err, SyncError::Authentication { ref operation, .. } if operation == "pulling branch main"),
        "got: {err}"
    );
}

#[test]
fn rejected_credential_on_tag_fetch_is_an_authentication_error() {
    let work = TempDir::new().unwrap();
    let repo = repo_behind_auth(&work);

    let err = repo.sync_tag("v1.0.0").unwrap_err();

    assert!(
        matches!(err, SyncError::Authentication { ref operation, .. } if operation == "fetching tag v1.0.0"),
        "got: {err}"
    );
}
