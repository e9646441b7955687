//! A git repository used as a replication target.
//!
//! Documents map back onto git objects and refs:
//!
//! - blobs, trees and commits are written with `hash-object`, `mktree` and
//!   `commit-tree`; the resulting hash must equal the document's `sha`
//! - a branch document moves `refs/heads/<name>` with `update-ref`, using
//!   the previous commit as the expected old value
//! - the branch list is derived from the refs; writing it only checks that
//!   every listed branch exists, branches are never deleted
//!
//! Revision tokens are the object hash for content, the head commit for a
//! branch and a digest of the derived list for the branch list, so the
//! generic writers can detect concurrent ref updates.

use async_trait::async_trait;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ModelError, ResolveError, StoreError};
use crate::git::{GitRepo, GitResolver};
use crate::mode::symbolic_to_octal;
use crate::object::{hash_hex_len, Commit, Document, ObjectRef, Tree};
use crate::resolver::Resolver;
use crate::store::{
    document_id, split_revision, BulkResult, PutOutcome, StoreResult, StoredDocument, TargetStore,
};

/// Git repository exposed through the document store interface.
#[derive(Debug, Clone)]
pub struct GitObjectStore {
    resolver: GitResolver,
}

impl GitObjectStore {
    /// Write into an existing repository's local branches.
    pub fn new(repo: GitRepo) -> Self {
        Self {
            resolver: GitResolver::new(repo),
        }
    }

    /// Create the repository at `dir` if needed.
    pub async fn init(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        Ok(Self::new(GitRepo::init(dir).await?))
    }

    pub fn repo(&self) -> &GitRepo {
        self.resolver.repo()
    }

    async fn derive(&self, reference: &ObjectRef) -> StoreResult<Option<Document>> {
        match self.resolver.resolve(reference).await {
            Ok(document) => Ok(Some(document)),
            Err(ResolveError::Missing(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn current_revision(&self, reference: &ObjectRef) -> StoreResult<Option<String>> {
        match self.derive(reference).await? {
            Some(document) => Ok(Some(revision_of(&document)?)),
            None => Ok(None),
        }
    }

    /// Write a content object and return the hash git assigned to it.
    async fn write_object(&self, document: &Document) -> StoreResult<String> {
        let repo = self.repo();
        let out = match document {
            Document::Blob(blob) => {
                let data = blob.content.to_bytes()?;
                repo.run_with_input(&["hash-object", "-w", "-t", "blob", "--stdin"], &data, &[])
                    .await?
            }
            Document::Tree(tree) => {
                repo.run_with_input(&["mktree", "-z"], &mktree_input(tree)?, &[])
                    .await?
            }
            Document::Commit(commit) => self.write_commit(commit).await?,
            _ => return Err(StoreError::Unsupported("writing refs as objects")),
        };
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn write_commit(&self, commit: &Commit) -> StoreResult<Vec<u8>> {
        let tree = commit.tree.name().unwrap_or_default();
        let mut args = vec!["commit-tree", "--no-gpg-sign", tree];
        for parent in &commit.parents {
            args.push("-p");
            args.push(parent.name().unwrap_or_default());
        }
        let env = [
            ("GIT_AUTHOR_NAME", commit.author.name.as_str()),
            ("GIT_AUTHOR_EMAIL", commit.author.email.as_str()),
            ("GIT_AUTHOR_DATE", commit.author.date.as_str()),
            ("GIT_COMMITTER_NAME", commit.committer.name.as_str()),
            ("GIT_COMMITTER_EMAIL", commit.committer.email.as_str()),
            ("GIT_COMMITTER_DATE", commit.committer.date.as_str()),
        ];
        Ok(self
            .repo()
            .run_with_input(&args, commit.message.as_bytes(), &env)
            .await?)
    }

    /// Write a content document, checking it hashes to its id.
    async fn store_object(&self, reference: &ObjectRef, document: &Document) -> StoreResult<String> {
        let actual = self.write_object(document).await?;
        if Some(actual.as_str()) != reference.name() {
            return Err(StoreError::HashMismatch {
                id: reference.id(),
                actual,
            });
        }
        Ok(actual)
    }

    async fn put_branch(
        &self,
        reference: &ObjectRef,
        name: &str,
        commit: &str,
        revision: Option<&str>,
    ) -> StoreResult<PutOutcome> {
        let full = self.repo().branch_ref(name);
        let zero = "0".repeat(hash_hex_len());
        let old = revision.unwrap_or(&zero);
        let output = self
            .repo()
            .try_run(&["update-ref", full.as_str(), commit, old])
            .await?;
        if output.status.success() {
            tracing::debug!(branch = name, commit, "Moved branch");
            return Ok(PutOutcome::Written {
                revision: commit.to_string(),
            });
        }
        let current = self.repo().branch_commit(name).await?;
        if current.as_deref() != revision {
            return Ok(PutOutcome::Conflict);
        }
        Err(StoreError::WriteRejected {
            id: reference.id(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Check a branch list against the refs; nothing is written.
    async fn check_branch_list(
        &self,
        branches: &[ObjectRef],
        pending: &HashMap<String, String>,
    ) -> StoreResult<Option<String>> {
        for branch in branches {
            let Some(name) = branch.name() else { continue };
            if pending.contains_key(name) {
                continue;
            }
            if self.repo().branch_commit(name).await?.is_none() {
                return Ok(Some(format!("branch {} does not exist", name)));
            }
        }
        Ok(None)
    }
}

/// Revision token of a derived document.
fn revision_of(document: &Document) -> StoreResult<String> {
    Ok(match document {
        Document::Branches(list) => {
            let bytes = serde_json::to_vec(list).map_err(ModelError::from)?;
            hex::encode(Sha1::digest(&bytes))
        }
        Document::Branch(head) => head.commit.name().unwrap_or_default().to_string(),
        Document::Commit(c) => c.sha.clone(),
        Document::Tree(t) => t.sha.clone(),
        Document::Blob(b) => b.sha.clone(),
    })
}

/// `mktree -z` input: `<octal mode> <type> <sha>\t<name>\0` per entry.
fn mktree_input(tree: &Tree) -> StoreResult<Vec<u8>> {
    let mut input = Vec::new();
    for entry in &tree.children {
        let mode = symbolic_to_octal(&entry.mode)?;
        input.extend_from_slice(
            format!(
                "{} {} {}\t",
                mode,
                entry.child.kind(),
                entry.child.name().unwrap_or_default()
            )
            .as_bytes(),
        );
        input.extend_from_slice(entry.basename.as_bytes());
        input.push(0);
    }
    Ok(input)
}

/// Parse a payload and check it is stored under its own id.
fn parse_payload(id: &str, body: &Value) -> StoreResult<(ObjectRef, Document)> {
    let reference = ObjectRef::from_id(id)?;
    let document = Document::from_value(body)?;
    if document.object_ref()? != reference {
        return Err(StoreError::WriteRejected {
            id: id.to_string(),
            reason: format!("payload describes {}", document.object_ref()?),
        });
    }
    Ok((reference, document))
}

#[async_trait]
impl TargetStore for GitObjectStore {
    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        let out = self
            .repo()
            .run(&[
                "cat-file",
                "--batch-all-objects",
                "--batch-check=%(objecttype) %(objectname)",
            ])
            .await?;
        let mut ids = vec![ObjectRef::ROOT.id()];
        for line in String::from_utf8_lossy(&out).lines() {
            let Some((kind, hash)) = line.split_once(' ') else {
                continue;
            };
            if let Ok(kind) = crate::object::ObjectKind::parse(kind) {
                if let Ok(reference) = ObjectRef::content(kind, hash) {
                    ids.push(reference.id());
                }
            }
        }
        for name in self.repo().branch_names().await? {
            ids.push(ObjectRef::branch(name)?.id());
        }
        Ok(ids)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<StoredDocument>> {
        let Ok(reference) = ObjectRef::from_id(id) else {
            return Ok(None);
        };
        let Some(document) = self.derive(&reference).await? else {
            return Ok(None);
        };
        Ok(Some(StoredDocument {
            revision: revision_of(&document)?,
            body: document.to_value()?,
        }))
    }

    async fn put(&self, id: &str, body: &Value, revision: Option<&str>) -> StoreResult<PutOutcome> {
        let (_, body) = split_revision(body.clone());
        let (reference, document) = parse_payload(id, &body)?;
        match &document {
            Document::Branch(head) => {
                let commit = head.commit.name().unwrap_or_default();
                self.put_branch(&reference, &head.branch, commit, revision)
                    .await
            }
            Document::Branches(list) => {
                if self.current_revision(&reference).await?.as_deref() != revision {
                    return Ok(PutOutcome::Conflict);
                }
                if let Some(reason) = self.check_branch_list(&list.branches, &HashMap::new()).await? {
                    return Err(StoreError::WriteRejected {
                        id: id.to_string(),
                        reason,
                    });
                }
                // Refs are never deleted, so a list that leaves some out is
                // already satisfied.
                Ok(PutOutcome::Unchanged)
            }
            _ => {
                let revision = self.store_object(&reference, &document).await?;
                Ok(PutOutcome::Written { revision })
            }
        }
    }

    /// Objects are written first; they stay unreachable until the ref
    /// updates, which are applied in a single `update-ref` transaction.
    async fn put_all(&self, documents: &[Value]) -> StoreResult<Vec<BulkResult>> {
        let mut parsed = Vec::with_capacity(documents.len());
        let mut results = Vec::with_capacity(documents.len());
        let mut failed = false;
        let mut pending_heads: HashMap<String, String> = HashMap::new();

        for payload in documents {
            let id = document_id(payload).unwrap_or_default().to_string();
            let (revision, body) = split_revision(payload.clone());
            match parse_payload(&id, &body) {
                Ok((reference, document)) => {
                    let stale = match &document {
                        Document::Branch(head) => {
                            pending_heads.insert(
                                head.branch.clone(),
                                head.commit.name().unwrap_or_default().to_string(),
                            );
                            self.repo().branch_commit(&head.branch).await? != revision
                        }
                        Document::Branches(_) => {
                            self.current_revision(&reference).await? != revision
                        }
                        _ => false,
                    };
                    if stale {
                        results.push(BulkResult::failed(id, "conflict", "Document update conflict."));
                        failed = true;
                    } else {
                        results.push(BulkResult::ok(id, ""));
                        parsed.push((reference, document, revision));
                    }
                }
                Err(e) => {
                    results.push(BulkResult::failed(id, "bad_request", e.to_string()));
                    failed = true;
                }
            }
        }

        for (reference, document, _) in &parsed {
            if let Document::Branches(list) = document {
                if let Some(reason) = self.check_branch_list(&list.branches, &pending_heads).await? {
                    for result in results.iter_mut().filter(|r| r.id == reference.id()) {
                        *result = BulkResult::failed(result.id.clone(), "forbidden", reason.clone());
                    }
                    failed = true;
                }
            }
        }
        if failed {
            return Ok(results);
        }

        let mut transaction = String::new();
        let mut written = Vec::with_capacity(parsed.len());
        for (reference, document, revision) in &parsed {
            match document {
                Document::Branch(head) => {
                    let commit = head.commit.name().unwrap_or_default();
                    let zero = "0".repeat(hash_hex_len());
                    let old = revision.as_deref().unwrap_or(&zero);
                    transaction.push_str(&format!(
                        "update {} {} {}\n",
                        self.repo().branch_ref(&head.branch),
                        commit,
                        old
                    ));
                    written.push((reference.id(), commit.to_string()));
                }
                Document::Branches(_) => written.push((reference.id(), String::new())),
                _ => {
                    let hash = self.store_object(reference, document).await?;
                    written.push((reference.id(), hash));
                }
            }
        }

        if !transaction.is_empty() {
            let applied = self
                .repo()
                .run_with_input(&["update-ref", "--stdin"], transaction.as_bytes(), &[])
                .await;
            if let Err(e) = applied {
                tracing::warn!(error = %e, "Ref transaction failed");
                return Ok(written
                    .into_iter()
                    .map(|(id, _)| BulkResult::failed(id, "conflict", "ref transaction failed"))
                    .collect());
            }
        }

        let mut results = Vec::with_capacity(written.len());
        for (id, revision) in written {
            let revision = if revision.is_empty() {
                self.current_revision(&ObjectRef::ROOT)
                    .await?
                    .unwrap_or_default()
            } else {
                revision
            };
            results.push(BulkResult::ok(id, revision));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Signature, TreeEntry};

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn test_mktree_input() {
        let tree = Tree {
            sha: SHA_A.into(),
            children: vec![
                TreeEntry {
                    child: ObjectRef::blob(SHA_B).unwrap(),
                    basename: "a file".into(),
                    mode: "-rw-r--r--".into(),
                },
                TreeEntry {
                    child: ObjectRef::tree(SHA_A).unwrap(),
                    basename: "dir".into(),
                    mode: "d---------".into(),
                },
            ],
        };
        let expected = format!("100644 blob {}\ta file\0040000 tree {}\tdir\0", SHA_B, SHA_A);
        assert_eq!(mktree_input(&tree).unwrap(), expected.into_bytes());
    }

    #[test]
    fn test_revision_of_content_is_hash() {
        let sig = Signature {
            name: "a".into(),
            email: "a@b".into(),
            date: "2011-01-01 00:00:00 +0000".into(),
        };
        let commit = Document::Commit(Commit {
            sha: SHA_A.into(),
            author: sig.clone(),
            committer: sig,
            message: "m\n".into(),
            tree: ObjectRef::tree(SHA_B).unwrap(),
            parents: vec![],
        });
        assert_eq!(revision_of(&commit).unwrap(), SHA_A);
    }

    #[test]
    fn test_payload_must_match_id() {
        let body = Document::Branch(crate::object::BranchHead {
            branch: "master".into(),
            commit: ObjectRef::commit(SHA_A).unwrap(),
        })
        .to_value()
        .unwrap();
        assert!(parse_payload("git-branch-master", &body).is_ok());
        assert!(parse_payload("git-branch-other", &body).is_err());
        assert!(parse_payload("_design/x", &body).is_err());
    }
}
