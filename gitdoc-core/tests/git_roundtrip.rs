//! Push a real git repository into a document store and pull it back out.
//!
//! Skipped when no `git` binary is available.

use gitdoc_core::{
    CasWriter, Document, DocumentWriter, GitObjectStore, GitRepo, GitResolver, MemoryStore,
    ObjectRef, Replicator, ResolveError, StoreResolver, SyncError,
};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

fn git(dir: &Path, args: &[&str]) -> Vec<u8> {
    let out = Command::new("git")
        .args(["-c", "user.name=A U Thor", "-c", "user.email=author@example.com"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_DATE", "2011-03-01 10:00:00 +0100")
        .env("GIT_COMMITTER_DATE", "2011-03-01 10:00:00 +0100")
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    out.stdout
}

fn rev_parse(dir: &Path, rev: &str) -> String {
    String::from_utf8(git(dir, &["rev-parse", rev]))
        .unwrap()
        .trim()
        .to_string()
}

/// Two commits on master plus a `topic` branch at the first one.
fn fixture() -> TempDir {
    let dir = TempDir::new().unwrap();
    let path = dir.path();
    git(path, &["init", "--quiet"]);
    git(path, &["symbolic-ref", "HEAD", "refs/heads/master"]);

    std::fs::write(path.join("README"), "hello\n").unwrap();
    std::fs::create_dir(path.join("src")).unwrap();
    std::fs::write(path.join("src/data.bin"), (0..=255u8).collect::<Vec<_>>()).unwrap();
    git(path, &["add", "-A"]);
    git(path, &["commit", "--quiet", "-m", "Initial commit"]);
    git(path, &["branch", "topic"]);

    std::fs::write(path.join("README"), "hello again\n").unwrap();
    git(path, &["commit", "--quiet", "-a", "-m", "Update README\n\nWith a body."]);
    dir
}

async fn push(source: &Path) -> MemoryStore {
    let resolver = GitResolver::new(GitRepo::open(source));
    let target = MemoryStore::new();
    let writer = CasWriter::new(&target);
    Replicator::new(&resolver, &target, &writer)
        .run()
        .await
        .unwrap();
    target
}

#[tokio::test]
async fn test_push_repository() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let repo = fixture();
    let target = push(repo.path()).await;

    // 3 blobs, 3 trees, 2 commits, 2 branches and the branch list.
    assert_eq!(target.len(), 11);
    assert_eq!(target.writes().last().map(String::as_str), Some("git-branches"));

    let root = Document::from_value(&target.document("git-branches").unwrap()).unwrap();
    let Document::Branches(list) = root else {
        panic!("expected the branch list");
    };
    assert_eq!(
        list.branches,
        vec![
            ObjectRef::branch("master").unwrap(),
            ObjectRef::branch("topic").unwrap()
        ]
    );

    let master = rev_parse(repo.path(), "master");
    let head = target.document("git-branch-master").unwrap();
    assert_eq!(head["commit"]["sha"], master.as_str());

    let commit = target.document(&format!("git-commit-{}", master)).unwrap();
    assert_eq!(commit["message"], "Update README\n\nWith a body.\n");
    assert_eq!(commit["author"]["name"], "A U Thor");
    assert_eq!(commit["parents"][0]["sha"], rev_parse(repo.path(), "topic").as_str());

    let data = rev_parse(repo.path(), "master:src/data.bin");
    let blob = target.document(&format!("git-blob-{}", data)).unwrap();
    assert_eq!(blob["encoding"], "base64");

    let readme = rev_parse(repo.path(), "master:README");
    let blob = target.document(&format!("git-blob-{}", readme)).unwrap();
    assert_eq!(blob["raw"], "hello again\n");
}

#[tokio::test]
async fn test_pull_reproduces_history() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let repo = fixture();
    let documents = push(repo.path()).await;

    let dest = TempDir::new().unwrap();
    let store = GitObjectStore::init(dest.path().join("copy")).await.unwrap();
    let resolver = StoreResolver::new(&documents);
    let writer = CasWriter::new(&store);
    let summary = Replicator::new(&resolver, &store, &writer)
        .run()
        .await
        .unwrap();
    assert_eq!(summary.committed, 11);

    let copy = store.repo().dir().to_path_buf();
    for rev in ["master", "topic", "master:src/data.bin", "master^{tree}"] {
        assert_eq!(rev_parse(&copy, rev), rev_parse(repo.path(), rev), "{}", rev);
    }
    assert_eq!(
        git(&copy, &["cat-file", "blob", "master:src/data.bin"]),
        (0..=255u8).collect::<Vec<_>>()
    );

    // Everything is already there the second time round. A branch that only
    // exists locally leaves the stored branch list satisfied.
    git(&copy, &["branch", "scratch", "master"]);
    let before = writer.stats();
    let again = Replicator::new(&resolver, &store, &writer)
        .run()
        .await
        .unwrap();
    let after = writer.stats();
    assert_eq!(again.initially_settled, 8);
    assert_eq!(after.written, before.written);
    assert_eq!(after.unchanged - before.unchanged, 3);
    assert_eq!(rev_parse(&copy, "scratch"), rev_parse(&copy, "master"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_non_utf8_file_name_fails_the_run() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let dir = TempDir::new().unwrap();
    let path = dir.path();
    git(path, &["init", "--quiet"]);
    git(path, &["symbolic-ref", "HEAD", "refs/heads/master"]);
    let name = OsStr::from_bytes(b"caf\xe9.txt");
    if std::fs::write(path.join(name), "latin-1 name\n").is_err() {
        eprintln!("file system rejects non-UTF-8 names, skipping");
        return;
    }
    git(path, &["add", "-A"]);
    git(path, &["commit", "--quiet", "-m", "Add latin-1 name"]);

    let resolver = GitResolver::new(GitRepo::open(path));
    let target = MemoryStore::new();
    let writer = CasWriter::new(&target);
    let result = Replicator::new(&resolver, &target, &writer).run().await;

    assert!(matches!(
        result,
        Err(SyncError::Resolve(ResolveError::Unparsable { what: "tree entry", .. }))
    ));
    let tree = rev_parse(path, "master^{tree}");
    assert!(!target.contains(&format!("git-tree-{}", tree)));
    assert!(!target.contains("git-branches"));
}
