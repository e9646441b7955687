//! gitdoc Core Library
//!
//! Core functionality for replicating a git object graph into a document
//! store (and back) including:
//! - Object model (branch list, branch, commit, tree, blob) and store ids
//! - Resolvers reading git repositories or document stores
//! - Target stores: HTTP document store, in-memory store, git repository
//! - Conflict-safe writers (compare-and-swap retry, atomic batch)
//! - Dependency-ordered replication engine with bounded memory
//! - Sync configuration

pub mod config;
pub mod couch;
pub mod engine;
pub mod error;
pub mod git;
pub mod git_store;
pub mod memory;
pub mod mode;
pub mod object;
pub mod resolver;
pub mod store;
pub mod writer;

pub use config::{SyncConfig, WriteStrategy};
pub use couch::CouchStore;
pub use engine::{EngineConfig, Replicator, RunSummary};
pub use error::{ModelError, ResolveError, Result, StoreError, SyncError};
pub use git::{GitRepo, GitResolver};
pub use git_store::GitObjectStore;
pub use memory::MemoryStore;
pub use object::{
    Blob, BlobContent, BranchHead, BranchList, Commit, Document, ObjectHash, ObjectKind, ObjectRef,
    Signature, Tree, TreeEntry,
};
pub use resolver::{Resolver, StoreResolver};
pub use store::{PutOutcome, StoredDocument, TargetStore};
pub use writer::{writer_for, AtomicBatchWriter, CasWriter, DocumentWriter, WriteStats};
