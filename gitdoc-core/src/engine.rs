//! Replication engine
//!
//! Walks the object graph from a set of seeds and writes every reachable
//! document to the target store, each one only after all of its
//! dependencies are durable there.
//!
//! A run keeps four pieces of state:
//! - `pending`: LIFO worklist of references still to process
//! - `settled`: references known to be durable in the target
//! - `cache`: resolved documents waiting on dependencies
//! - `mutable_cache`: the branch list and branch entries of `cache`, kept
//!   across cache evictions
//!
//! Immutable ids already present in the target are settled by the initial
//! scan. Mutable ids are always re-resolved and re-written, which is how
//! branch moves propagate. Nothing is ever deleted.
//!
//! Both bounds (cache size and worklist length) are heuristics that trade
//! repeated work for memory; evicted documents are resolved again later and
//! already-settled references are skipped when popped.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::error::{ResolveError, Result, SyncError};
use crate::object::{is_replicated_id, Document, ObjectKind, ObjectRef};
use crate::resolver::Resolver;
use crate::store::TargetStore;
use crate::writer::DocumentWriter;

/// Cache size and worklist length that trigger overflow handling.
pub const DEFAULT_HIGH_WATER_MARK: usize = 100_000;

/// Most recently pushed worklist entries dropped on overflow.
pub const DEFAULT_TRUNCATE_COUNT: usize = 50_000;

const MIN_HIGH_WATER_MARK: usize = 15;

/// Overflow thresholds of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub high_water_mark: usize,
    pub truncate_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            truncate_count: DEFAULT_TRUNCATE_COUNT,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.high_water_mark <= MIN_HIGH_WATER_MARK {
            return Err(SyncError::Config(format!(
                "high_water_mark must exceed {}, got {}",
                MIN_HIGH_WATER_MARK, self.high_water_mark
            )));
        }
        if self.truncate_count == 0 || self.truncate_count >= self.high_water_mark {
            return Err(SyncError::Config(format!(
                "truncate_count must be between 1 and {}, got {}",
                self.high_water_mark - 1,
                self.truncate_count
            )));
        }
        Ok(())
    }
}

/// Counters describing one finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Immutable ids found in the target before the walk started.
    pub initially_settled: usize,
    pub resolved: u64,
    pub committed: u64,
    /// Popped references that were already settled.
    pub skipped: u64,
    pub cache_evictions: u64,
    pub worklist_truncations: u64,
}

/// Ordering key: commits, then trees, then everything else; ties by name,
/// then by the full reference.
pub fn priority_key(reference: &ObjectRef) -> (u8, Option<&str>, &ObjectRef) {
    let rank = match reference.kind() {
        ObjectKind::Commit => 0,
        ObjectKind::Tree => 1,
        _ => 2,
    };
    (rank, reference.name(), reference)
}

/// Push a batch so that its highest priority entry is popped first.
pub fn push_prioritized(pending: &mut Vec<ObjectRef>, batch: impl IntoIterator<Item = ObjectRef>) {
    let mut batch: Vec<ObjectRef> = batch.into_iter().collect();
    batch.sort_by(|a, b| priority_key(a).cmp(&priority_key(b)));
    pending.extend(batch.into_iter().rev());
}

#[derive(Debug, Default)]
struct RunState {
    pending: Vec<ObjectRef>,
    settled: HashSet<ObjectRef>,
    cache: HashMap<ObjectRef, Document>,
    mutable_cache: HashMap<ObjectRef, Document>,
    summary: RunSummary,
}

impl RunState {
    fn new(seeds: &[ObjectRef]) -> Self {
        let mut state = Self::default();
        push_prioritized(&mut state.pending, seeds.iter().cloned());
        state
    }

    /// Apply both overflow valves.
    fn bound(&mut self, config: &EngineConfig, seeds: &[ObjectRef]) {
        if self.cache.len() > config.high_water_mark {
            tracing::warn!(
                cached = self.cache.len(),
                kept = self.mutable_cache.len(),
                "Document cache overflow, evicting immutable entries"
            );
            self.cache.clone_from(&self.mutable_cache);
            self.summary.cache_evictions += 1;
        }

        if self.pending.len() > config.high_water_mark {
            let before = self.pending.len();
            self.pending.truncate(before - config.truncate_count);
            let retained = std::mem::take(&mut self.pending);
            push_prioritized(&mut self.pending, seeds.iter().cloned());
            push_prioritized(&mut self.pending, retained);
            self.summary.worklist_truncations += 1;
            tracing::warn!(
                before,
                after = self.pending.len(),
                "Worklist overflow, dropped most recent entries"
            );
            if self.pending.len() > config.high_water_mark {
                tracing::warn!(
                    pending = self.pending.len(),
                    "Worklist still above high water mark after truncation, lots of seeds?"
                );
            }
        }
    }
}

/// One replication walk from a resolver into a target store.
pub struct Replicator<'a, R: ?Sized, S: ?Sized, W: ?Sized> {
    resolver: &'a R,
    store: &'a S,
    writer: &'a W,
    config: EngineConfig,
    seeds: Vec<ObjectRef>,
}

impl<'a, R, S, W> Replicator<'a, R, S, W>
where
    R: Resolver + ?Sized,
    S: TargetStore + ?Sized,
    W: DocumentWriter + ?Sized,
{
    /// `store` is scanned for settled ids; `writer` commits into the same store.
    pub fn new(resolver: &'a R, store: &'a S, writer: &'a W) -> Self {
        Self {
            resolver,
            store,
            writer,
            config: EngineConfig::default(),
            seeds: vec![ObjectRef::ROOT],
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<ObjectRef>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Replicate everything reachable from the seeds.
    pub async fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        if self.seeds.is_empty() {
            return Err(SyncError::Config("at least one seed is required".into()));
        }

        let mut state = RunState::new(&self.seeds);
        self.scan(&mut state).await?;
        tracing::info!(
            settled = state.summary.initially_settled,
            seeds = self.seeds.len(),
            "Starting replication run"
        );

        while let Some(reference) = state.pending.pop() {
            self.step(&mut state, reference).await?;
            state.bound(&self.config, &self.seeds);
        }

        let summary = state.summary;
        tracing::info!(
            resolved = summary.resolved,
            committed = summary.committed,
            skipped = summary.skipped,
            cache_evictions = summary.cache_evictions,
            worklist_truncations = summary.worklist_truncations,
            "Replication run finished"
        );
        Ok(summary)
    }

    /// Settle every immutable object the target already has.
    async fn scan(&self, state: &mut RunState) -> Result<()> {
        for id in self.store.list_ids().await? {
            if !is_replicated_id(&id) {
                continue;
            }
            let reference = ObjectRef::from_id(&id)?;
            if !reference.is_mutable() {
                state.settled.insert(reference);
            }
        }
        state.summary.initially_settled = state.settled.len();
        Ok(())
    }

    async fn resolve(&self, reference: &ObjectRef) -> Result<Document> {
        let document = self.resolver.resolve(reference).await?;
        let resolved = document.object_ref()?;
        if resolved != *reference {
            return Err(ResolveError::Unparsable {
                id: reference.id(),
                what: "document",
                detail: format!("resolver returned {}", resolved),
            }
            .into());
        }
        document.validate()?;
        Ok(document)
    }

    async fn step(&self, state: &mut RunState, reference: ObjectRef) -> Result<()> {
        if state.settled.contains(&reference) {
            state.summary.skipped += 1;
            return Ok(());
        }

        let document = match state.cache.entry(reference.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::debug!(id = %reference, pending = state.pending.len(), "Resolving");
                let document = self.resolve(&reference).await?;
                state.summary.resolved += 1;
                if reference.is_mutable() {
                    state
                        .mutable_cache
                        .insert(reference.clone(), document.clone());
                }
                entry.insert(document)
            }
        };

        let mut seen = HashSet::new();
        let missing: Vec<ObjectRef> = document
            .dependencies()
            .filter(|dep| !state.settled.contains(*dep) && seen.insert(*dep))
            .cloned()
            .collect();

        if missing.is_empty() {
            tracing::debug!(id = %reference, pending = state.pending.len(), "Committing");
            self.writer.commit(std::slice::from_ref(&*document)).await?;
            state.cache.remove(&reference);
            state.mutable_cache.remove(&reference);
            state.settled.insert(reference);
            state.summary.committed += 1;
        } else {
            state.pending.push(reference);
            push_prioritized(&mut state.pending, missing);
        }
        Ok(())
    }
}
