mod common;

use std::path::Path;
use std::sync::Arc;
use std::thread;

use stackcd_sync::{StackRepo, SyncError};
use tempfile::TempDir;

use common::{short, Remote};

fn clone(remote: &Remote, work: &TempDir) -> StackRepo {
    StackRepo::clone_or_open("infra", work.path().join("infra"), remote.url(), None)
        .expect("clone")
}

fn read(repo: &StackRepo, path: &str) -> String {
    String::from_utf8(repo.lock().read_file(Path::new(path)).expect("read")).expect("utf8")
}

#[test]
fn branch_sync_twice_without_remote_change_is_stable() {
    let remote = Remote::new();
    let head = remote.commit("main", &[("app.txt", "v1")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);

    let first = repo.sync_branch("main").expect("first sync");
    let second = repo.sync_branch("main").expect("second sync");

    assert_eq!(first, second);
    assert_eq!(first.as_str(), short(head));
}

#[test]
fn branch_sync_picks_up_new_commits() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "v1")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);
    repo.sync_branch("main").expect("sync");

    let next = remote.commit("main", &[("app.txt", "v2")]);
    let revision = repo.sync_branch("main").expect("sync after push");

    assert_eq!(revision.as_str(), short(next));
    assert_eq!(read(&repo, "app.txt"), "v2");
}

#[test]
fn branch_created_after_clone_is_fetched() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "main")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);

    let dev = remote.commit("dev", &[("app.txt", "dev")]);
    let revision = repo.sync_branch("dev").expect("sync dev");

    assert_eq!(revision.as_str(), short(dev));
    assert_eq!(read(&repo, "app.txt"), "dev");
}

#[test]
fn local_edits_are_discarded() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "clean")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);
    repo.sync_branch("main").expect("sync");

    std::fs::write(repo.path().join("app.txt"), "dirty").unwrap();
    repo.sync_branch("main").expect("resync");

    assert_eq!(read(&repo, "app.txt"), "clean");
}

#[test]
fn missing_branch_is_a_pull_error() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "v1")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);

    let err = repo.sync_branch("does-not-exist").unwrap_err();
    assert!(matches!(err, SyncError::Pull { ref branch, .. } if branch == "does-not-exist"));
    assert!(err.to_string().contains("infra"), "got: {err}");
}

#[test]
fn branch_deleted_upstream_is_a_pull_error() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "main")]);
    remote.commit("dev", &[("app.txt", "dev")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);
    repo.sync_branch("dev").expect("dev exists");

    remote.delete_branch("dev");
    let err = repo.sync_branch("dev").unwrap_err();

    assert!(matches!(err, SyncError::Pull { ref branch, .. } if branch == "dev"), "got: {err}");
    assert!(err.to_string().contains("couldn't find remote ref"), "got: {err}");
    assert_eq!(repo.sync_branch("main").unwrap().as_str().len(), 8);
}

#[test]
fn tag_sync_checks_out_the_tagged_commit() {
    let remote = Remote::new();
    let tagged = remote.commit("main", &[("app.txt", "release")]);
    remote.tag("v1.0.0", tagged);
    remote.commit("main", &[("app.txt", "unreleased")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);

    let revision = repo.sync_tag("v1.0.0").expect("sync tag");

    assert_eq!(revision.as_str(), short(tagged));
    assert_eq!(read(&repo, "app.txt"), "release");
}

#[test]
fn moved_tag_overwrites_the_local_one() {
    let remote = Remote::new();
    let old = remote.commit("main", &[("app.txt", "old")]);
    remote.tag("stable", old);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);
    assert_eq!(repo.sync_tag("stable").unwrap().as_str(), short(old));

    let new = remote.commit("main", &[("app.txt", "new")]);
    remote.tag("stable", new);
    let revision = repo.sync_tag("stable").expect("sync moved tag");

    assert_eq!(revision.as_str(), short(new));
    assert_eq!(read(&repo, "app.txt"), "new");
}

#[test]
fn missing_tag_is_a_fetch_error() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "v1")]);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);

    let err = repo.sync_tag("v9.9.9").unwrap_err();
    assert!(matches!(err, SyncError::Fetch { ref tag, .. } if tag == "v9.9.9"), "got: {err}");
}

#[test]
fn tag_deleted_upstream_is_a_fetch_error() {
    let remote = Remote::new();
    let tagged = remote.commit("main", &[("app.txt", "release")]);
    remote.tag("v1.0.0", tagged);
    let work = TempDir::new().unwrap();
    let repo = clone(&remote, &work);
    assert_eq!(repo.sync_tag("v1.0.0").unwrap().as_str(), short(tagged));

    remote.delete_tag("v1.0.0");
    let err = repo.sync_tag("v1.0.0").unwrap_err();

    assert!(matches!(err, SyncError::Fetch { ref tag, .. } if tag == "v1.0.0"), "got: {err}");
}

#[test]
fn existing_working_copy_is_reopened() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "v1")]);
    let work = TempDir::new().unwrap();
    let first = clone(&remote, &work);
    let path = first.path().to_path_buf();
    drop(first);

    let reopened = clone(&remote, &work);

    assert_eq!(reopened.path(), path);
    assert!(reopened.sync_branch("main").is_ok());
}

#[test]
fn concurrent_syncs_of_different_refs_read_their_own_content() {
    let remote = Remote::new();
    remote.commit("main", &[("app.txt", "main")]);
    remote.commit("dev", &[("app.txt", "dev")]);
    let work = TempDir::new().unwrap();
    let repo = Arc::new(clone(&remote, &work));

    let handles: Vec<_> = ["main", "dev"]
        .into_iter()
        .map(|branch| {
            let repo = Arc::clone(&repo);
            thread::spawn(move || {
                for _ in 0..20 {
                    let mut guard = repo.lock();
                    guard.sync_branch(branch).expect("sync");
                    let content = guard.read_file(Path::new("app.txt")).expect("read");
                    assert_eq!(content, branch.as_bytes(), "{branch} read foreign content");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked");
    }
}
