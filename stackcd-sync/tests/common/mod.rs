//! A local git "remote" built with git2, no network needed.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use git2::{IndexEntry, IndexTime, Oid, Repository, RepositoryInitOptions, Signature};
use tempfile::TempDir;

pub struct Remote {
    pub dir: TempDir,
    pub repo: Repository,
}

impl Remote {
    /// An empty repository whose default branch is `main`.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts).unwrap();
        Self { dir, repo }
    }

    pub fn url(&self) -> String {
        self.dir.path().display().to_string()
    }

    /// Commit `files` on top of `branch` (or of `main` when the branch is new)
    /// without touching the remote's working tree.
    pub fn commit(&self, branch: &str, files: &[(&str, &str)]) -> Oid {
        let refname = format!("refs/heads/{branch}");
        let parent = self
            .repo
            .find_reference(&refname)
            .or_else(|_| self.repo.find_reference("refs/heads/main"))
            .ok()
            .map(|r| r.peel_to_commit().unwrap());

        let mut index = git2::Index::new().unwrap();
        if let Some(parent) = &parent {
            index.read_tree(&parent.tree().unwrap()).unwrap();
        }
        for (path, content) in files {
            let mut entry = entry(path);
            entry.id = self.repo.blob(content.as_bytes()).unwrap();
            entry.file_size = content.len() as u32;
            index.add(&entry).unwrap();
        }
        let tree_id = index.write_tree_to(&self.repo).unwrap();
        let tree = self.repo.find_tree(tree_id).unwrap();

        let sig = Signature::now("stackcd", "stackcd@example.com").unwrap();
        let parents: Vec<_> = parent.iter().collect();
        let message = format!("update {branch}");
        self.repo
            .commit(Some(&refname), &sig, &sig, &message, &tree, &parents)
            .unwrap()
    }

    /// Point `tag` at `target`, replacing any existing tag of that name.
    pub fn tag(&self, tag: &str, target: Oid) {
        let object = self.repo.find_object(target, None).unwrap();
        self.repo.tag_lightweight(tag, &object, true).unwrap();
    }

    pub fn delete_branch(&self, branch: &str) {
        self.repo
            .find_reference(&format!("refs/heads/{branch}"))
            .unwrap()
            .delete()
            .unwrap();
    }

    pub fn delete_tag(&self, tag: &str) {
        self.repo.tag_delete(tag).unwrap();
    }
}

/// An HTTP git endpoint that answers every request with 401; returns its base URL.
///
/// The listener thread lives until the test process exits.
pub fn unauthorized_remote() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(
                b"HTTP/1.1 401 Unauthorized\r\n\
                  WWW-Authenticate: Basic realm=\"git\"\r\n\
                  Content-Length: 0\r\n\
                  Connection: close\r\n\r\n",
            );
        }
    });
    format!("http://{addr}/infra.git")
}

/// First 8 hex characters of `oid`, as a revision is reported.
pub fn short(oid: Oid) -> String {
    oid.to_string()[..8].to_string()
}

fn entry(path: &str) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: 0o100644,
        uid: 0,
        gid: 0,
        file_size: 0,
        id: Oid::zero(),
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}
