//! In-memory target store.
//!
//! Behaves like the HTTP document store (revision tokens, conflicts on stale
//! revisions, all-or-nothing bulk commits) and additionally records every
//! applied write, so tests can check the order in which a run committed
//! documents. Conflicts and write failures can be injected per id.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::store::{
    document_id, split_revision, BulkResult, PutOutcome, StoreResult, StoredDocument, TargetStore,
};

#[derive(Debug, Clone)]
struct Entry {
    generation: u64,
    body: Value,
}

impl Entry {
    fn revision(&self) -> String {
        format!("{}-mem", self.generation)
    }
}

#[derive(Debug, Default)]
struct Inner {
    docs: BTreeMap<String, Entry>,
    writes: Vec<String>,
    pending_conflicts: HashMap<String, u32>,
    failing: HashSet<String>,
}

impl Inner {
    fn current_revision(&self, id: &str) -> Option<String> {
        self.docs.get(id).map(Entry::revision)
    }

    fn apply(&mut self, id: &str, body: Value) -> String {
        let generation = self.docs.get(id).map_or(1, |e| e.generation + 1);
        let entry = Entry { generation, body };
        let revision = entry.revision();
        self.docs.insert(id.to_string(), entry);
        self.writes.push(id.to_string());
        revision
    }

    /// Simulate another writer touching `id` just before us.
    fn interfere(&mut self, id: &str) {
        match self.docs.get_mut(id) {
            Some(entry) => entry.generation += 1,
            None => {
                self.docs.insert(
                    id.to_string(),
                    Entry {
                        generation: 1,
                        body: serde_json::json!({ "_id": id, "written_by": "concurrent" }),
                    },
                );
            }
        }
    }
}

/// Thread-safe in-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a document without recording it as a write.
    pub fn insert(&self, id: &str, body: Value) {
        let (_, body) = split_revision(body);
        let mut inner = self.lock();
        let generation = inner.docs.get(id).map_or(1, |e| e.generation + 1);
        inner.docs.insert(id.to_string(), Entry { generation, body });
    }

    /// Current body of a document.
    pub fn document(&self, id: &str) -> Option<Value> {
        self.lock().docs.get(id).map(|e| e.body.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().docs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of applied writes, in order.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Make the next `times` writes of `id` lose a race against another writer.
    pub fn inject_conflicts(&self, id: &str, times: u32) {
        self.lock().pending_conflicts.insert(id.to_string(), times);
    }

    /// Make every write of `id` fail with a non-conflict error.
    pub fn fail_writes(&self, id: &str) {
        self.lock().failing.insert(id.to_string());
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock().docs.keys().cloned().collect())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<StoredDocument>> {
        Ok(self.lock().docs.get(id).map(|e| StoredDocument {
            revision: e.revision(),
            body: e.body.clone(),
        }))
    }

    async fn put(&self, id: &str, body: &Value, revision: Option<&str>) -> StoreResult<PutOutcome> {
        let mut inner = self.lock();
        if inner.failing.contains(id) {
            return Err(StoreError::WriteRejected {
                id: id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        if let Some(remaining) = inner.pending_conflicts.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                inner.interfere(id);
                return Ok(PutOutcome::Conflict);
            }
        }
        if inner.current_revision(id).as_deref() != revision {
            return Ok(PutOutcome::Conflict);
        }
        let (_, body) = split_revision(body.clone());
        let revision = inner.apply(id, body);
        Ok(PutOutcome::Written { revision })
    }

    async fn put_all(&self, documents: &[Value]) -> StoreResult<Vec<BulkResult>> {
        let mut inner = self.lock();
        let mut staged = Vec::with_capacity(documents.len());
        let mut results = Vec::with_capacity(documents.len());
        let mut failed = false;

        for doc in documents {
            let Some(id) = document_id(doc).map(str::to_string) else {
                results.push(BulkResult::failed("", "bad_request", "missing _id"));
                failed = true;
                continue;
            };
            let (revision, body) = split_revision(doc.clone());
            if inner.failing.contains(&id) {
                results.push(BulkResult::failed(id, "forbidden", "injected failure"));
                failed = true;
            } else if inner.current_revision(&id) != revision {
                results.push(BulkResult::failed(id, "conflict", "Document update conflict."));
                failed = true;
            } else {
                results.push(BulkResult::ok(id.clone(), ""));
                staged.push((id, body));
            }
        }

        if failed {
            return Ok(results);
        }
        let mut results = Vec::with_capacity(staged.len());
        for (id, body) in staged {
            let revision = inner.apply(&id, body);
            results.push(BulkResult::ok(id, revision));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_create_and_update() {
        let store = MemoryStore::new();
        let body = json!({"_id": "a", "v": 1});

        let rev = match store.put("a", &body, None).await.unwrap() {
            PutOutcome::Written { revision } => revision,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(store.put("a", &body, None).await.unwrap(), PutOutcome::Conflict);

        let updated = json!({"_id": "a", "v": 2});
        assert!(matches!(
            store.put("a", &updated, Some(&rev)).await.unwrap(),
            PutOutcome::Written { .. }
        ));
        assert_eq!(store.document("a").unwrap(), updated);
        assert_eq!(store.writes(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_get_splits_revision() {
        let store = MemoryStore::new();
        store.insert("a", json!({"_id": "a", "_rev": "9-x", "v": 1}));
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.body, json!({"_id": "a", "v": 1}));
        assert_eq!(stored.revision, "1-mem");
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_injected_conflict_moves_revision() {
        let store = MemoryStore::new();
        store.insert("a", json!({"_id": "a"}));
        store.inject_conflicts("a", 1);
        let rev = store.get("a").await.unwrap().unwrap().revision;
        assert_eq!(
            store.put("a", &json!({"_id": "a", "v": 1}), Some(&rev)).await.unwrap(),
            PutOutcome::Conflict
        );
        let fresh = store.get("a").await.unwrap().unwrap().revision;
        assert_ne!(fresh, rev);
    }

    #[tokio::test]
    async fn test_put_all_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.insert("b", json!({"_id": "b"}));

        let results = store
            .put_all(&[json!({"_id": "a"}), json!({"_id": "b"})])
            .await
            .unwrap();
        assert!(results[1].is_error());
        assert!(!store.contains("a"));
        assert!(store.writes().is_empty());

        let results = store
            .put_all(&[json!({"_id": "a"}), json!({"_id": "b", "_rev": "1-mem"})])
            .await
            .unwrap();
        assert!(results.iter().all(|r| !r.is_error()));
        assert_eq!(store.writes(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.fail_writes("a");
        assert!(matches!(
            store.put("a", &json!({"_id": "a"}), None).await,
            Err(StoreError::WriteRejected { .. })
        ));
    }
}
