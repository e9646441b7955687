//! Source side of a replication run.
//!
//! A [`Resolver`] produces the full document for a reference. Git
//! repositories resolve through [`crate::git::GitResolver`]; a document
//! store resolves through [`StoreResolver`], which is how the reverse
//! direction reads its source.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ResolveError;
use crate::object::{Document, ObjectRef};
use crate::store::TargetStore;

/// Produces documents from a source of truth.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a reference. Fails with [`ResolveError::Missing`] if the
    /// source does not have the object.
    async fn resolve(&self, reference: &ObjectRef) -> Result<Document, ResolveError>;
}

#[async_trait]
impl<T: Resolver + ?Sized> Resolver for Arc<T> {
    async fn resolve(&self, reference: &ObjectRef) -> Result<Document, ResolveError> {
        (**self).resolve(reference).await
    }
}

/// Reads documents back out of a document store.
#[derive(Debug, Clone)]
pub struct StoreResolver<S> {
    store: S,
}

impl<S: TargetStore> StoreResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: TargetStore> Resolver for StoreResolver<S> {
    async fn resolve(&self, reference: &ObjectRef) -> Result<Document, ResolveError> {
        let id = reference.id();
        let stored = self
            .store
            .get(&id)
            .await
            .map_err(Box::new)?
            .ok_or_else(|| ResolveError::Missing(id.clone()))?;
        let document = Document::from_value(&stored.body)?;
        if document.object_ref()? != *reference {
            return Err(ResolveError::Unparsable {
                id,
                what: "document",
                detail: format!("stored under the wrong id ({})", document.object_ref()?),
            });
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::object::BranchHead;
    use serde_json::json;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    #[tokio::test]
    async fn test_resolve_from_store() {
        let store = MemoryStore::new();
        let head = Document::Branch(BranchHead {
            branch: "master".into(),
            commit: ObjectRef::commit(SHA).unwrap(),
        });
        store.insert("git-branch-master", head.to_value().unwrap());

        let resolver = StoreResolver::new(store);
        let reference = ObjectRef::branch("master").unwrap();
        assert_eq!(resolver.resolve(&reference).await.unwrap(), head);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let resolver = StoreResolver::new(MemoryStore::new());
        let err = resolver.resolve(&ObjectRef::ROOT).await.unwrap_err();
        assert!(matches!(err, ResolveError::Missing(id) if id == "git-branches"));
    }

    #[tokio::test]
    async fn test_malformed_document() {
        let store = MemoryStore::new();
        store.insert(
            "git-branch-master",
            json!({"_id": "git-branch-master", "type": "git-branch", "branch": "master"}),
        );
        let resolver = StoreResolver::new(store);
        let reference = ObjectRef::branch("master").unwrap();
        assert!(matches!(
            resolver.resolve(&reference).await,
            Err(ResolveError::Model(_))
        ));
    }

    #[tokio::test]
    async fn test_document_under_wrong_id() {
        let store = MemoryStore::new();
        let head = Document::Branch(BranchHead {
            branch: "other".into(),
            commit: ObjectRef::commit(SHA).unwrap(),
        });
        store.insert("git-branch-master", head.to_value().unwrap());
        let resolver = StoreResolver::new(store);
        let reference = ObjectRef::branch("master").unwrap();
        assert!(matches!(
            resolver.resolve(&reference).await,
            Err(ResolveError::Unparsable { .. })
        ));
    }
}
