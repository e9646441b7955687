//! Conflict-safe document writers.
//!
//! Two interchangeable strategies sit behind [`DocumentWriter`]:
//!
//! - [`CasWriter`] writes one document at a time with a compare-and-swap
//!   loop: read, skip if unchanged, write against the read revision, and
//!   start over on conflict. The loop is unbounded unless a ceiling is
//!   configured; sustained contention only shows up as a warning every
//!   [`CONTENTION_WARN_INTERVAL`] attempts.
//! - [`AtomicBatchWriter`] submits every document in one all-or-nothing
//!   bulk request. Any per-document error fails the whole call and the
//!   caller must assume nothing was applied.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{SyncConfig, WriteStrategy};
use crate::error::{Result, StoreError, SyncError};
use crate::object::Document;
use crate::store::{with_revision, PutOutcome, TargetStore};

/// Attempts between two contention warnings for the same document.
pub const CONTENTION_WARN_INTERVAL: u64 = 1000;

/// Snapshot of a writer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Documents actually written.
    pub written: u64,
    /// Documents skipped because the stored copy was already equal.
    pub unchanged: u64,
    /// Writes that lost a race and were retried.
    pub conflicts: u64,
}

#[derive(Debug, Default)]
struct WriteCounters {
    written: AtomicU64,
    unchanged: AtomicU64,
    conflicts: AtomicU64,
}

impl WriteCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WriteStats {
        WriteStats {
            written: self.written.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a read-modify-write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written { revision: String },
    Unchanged,
}

/// Commits documents to a target store.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    /// Make `documents` durable. Returns only once they are visible.
    async fn commit(&self, documents: &[Document]) -> Result<()>;

    fn stats(&self) -> WriteStats;
}

/// Per-document compare-and-swap writer.
#[derive(Debug)]
pub struct CasWriter<S> {
    store: S,
    max_attempts: Option<u64>,
    counters: WriteCounters,
}

impl<S: TargetStore> CasWriter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_attempts: None,
            counters: WriteCounters::default(),
        }
    }

    /// Give up with [`SyncError::Contention`] after `max` conflicting attempts.
    pub fn with_max_attempts(mut self, max: Option<u64>) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Read-modify-write `id`.
    ///
    /// `update` receives the current body (without revision) or `None` and
    /// returns the desired body. An unchanged body is not written.
    pub async fn update<F>(&self, id: &str, mut update: F) -> Result<UpdateOutcome>
    where
        F: FnMut(Option<&Value>) -> Value + Send,
    {
        let mut attempt: u64 = 0;
        loop {
            if attempt > 0 && attempt % CONTENTION_WARN_INTERVAL == 0 {
                tracing::warn!(id, attempt, "write contention: still retrying");
            }
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(SyncError::Contention {
                    id: id.to_string(),
                    attempts: attempt,
                });
            }

            let outcome = match self.store.get(id).await? {
                None => {
                    let desired = update(None);
                    self.store.put(id, &desired, None).await?
                }
                Some(current) => {
                    let desired = update(Some(&current.body));
                    if desired == current.body {
                        WriteCounters::bump(&self.counters.unchanged);
                        return Ok(UpdateOutcome::Unchanged);
                    }
                    self.store
                        .put(id, &desired, Some(&current.revision))
                        .await?
                }
            };

            match outcome {
                PutOutcome::Written { revision } => {
                    WriteCounters::bump(&self.counters.written);
                    return Ok(UpdateOutcome::Written { revision });
                }
                PutOutcome::Unchanged => {
                    WriteCounters::bump(&self.counters.unchanged);
                    return Ok(UpdateOutcome::Unchanged);
                }
                PutOutcome::Conflict => {
                    WriteCounters::bump(&self.counters.conflicts);
                    tracing::debug!(id, attempt, "write conflict, retrying");
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<S: TargetStore> DocumentWriter for CasWriter<S> {
    async fn commit(&self, documents: &[Document]) -> Result<()> {
        for document in documents {
            let id = document.object_ref()?.id();
            let body = document.to_value()?;
            self.update(&id, |_| body.clone()).await?;
        }
        Ok(())
    }

    fn stats(&self) -> WriteStats {
        self.counters.snapshot()
    }
}

/// All-or-nothing bulk writer.
#[derive(Debug)]
pub struct AtomicBatchWriter<S> {
    store: S,
    counters: WriteCounters,
}

impl<S: TargetStore> AtomicBatchWriter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            counters: WriteCounters::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: TargetStore> DocumentWriter for AtomicBatchWriter<S> {
    async fn commit(&self, documents: &[Document]) -> Result<()> {
        let mut batch = Vec::with_capacity(documents.len());
        for document in documents {
            let id = document.object_ref()?.id();
            let body = document.to_value()?;
            match self.store.get(&id).await? {
                Some(current) if current.body == body => {
                    WriteCounters::bump(&self.counters.unchanged);
                }
                Some(current) => batch.push(with_revision(&body, Some(&current.revision))),
                None => batch.push(body),
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let results = self.store.put_all(&batch).await?;
        let failed: Vec<String> = results
            .iter()
            .filter(|r| r.is_error())
            .map(|r| {
                format!(
                    "{} ({}: {})",
                    r.id,
                    r.error.as_deref().unwrap_or_default(),
                    r.reason.as_deref().unwrap_or_default()
                )
            })
            .collect();
        if !failed.is_empty() {
            return Err(StoreError::AtomicBatch { failed }.into());
        }
        self.counters
            .written
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> WriteStats {
        self.counters.snapshot()
    }
}

/// Build the writer selected by `config`.
pub fn writer_for<S>(store: S, config: &SyncConfig) -> Box<dyn DocumentWriter>
where
    S: TargetStore + 'static,
{
    match config.write_strategy {
        WriteStrategy::Cas => {
            Box::new(CasWriter::new(store).with_max_attempts(config.max_write_attempts))
        }
        WriteStrategy::Atomic => Box::new(AtomicBatchWriter::new(store)),
    }
}
