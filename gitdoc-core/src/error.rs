//! Error types for gitdoc.
//!
//! Each component has its own error enum; [`SyncError`] joins them for a
//! replication run. Write conflicts are not errors: the store reports them
//! as [`crate::store::PutOutcome::Conflict`] and the writer retries.

use crate::object::ObjectKind;

/// Result alias for replication runs.
pub type Result<T> = std::result::Result<T, SyncError>;

/// A reference, id or document failed validation.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Malformed object id: {0:?}")]
    MalformedId(String),

    #[error("Unknown object kind: {0:?}")]
    UnknownKind(String),

    #[error("Invalid {kind} hash {hash:?}: expected {expected} hex characters")]
    InvalidHash {
        kind: ObjectKind,
        hash: String,
        expected: usize,
    },

    #[error("{0} is not a content kind")]
    NotContentKind(ObjectKind),

    #[error("Empty branch name")]
    EmptyBranchName,

    #[error("Document {id} stores id {stored:?}")]
    IdMismatch { id: String, stored: String },

    #[error("Document field {field} of {id} must reference a {expected}, found {found}")]
    WrongReferenceKind {
        id: String,
        field: &'static str,
        expected: &'static str,
        found: ObjectKind,
    },

    #[error("Invalid tree entry mode {0:?}")]
    InvalidMode(String),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Document encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The source could not produce a document for a reference.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Failed to run `git {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unable to parse {what} for {id}: {detail}")]
    Unparsable {
        id: String,
        what: &'static str,
        detail: String,
    },

    #[error("Object {0} is not present in the source")]
    Missing(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Source store error: {0}")]
    Store(#[from] Box<StoreError>),
}

/// The target store failed in a way the writer cannot recover from.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP error for {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} failed ({status}): {body}")]
    UnexpectedStatus {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid store url {0:?}")]
    InvalidUrl(String),

    #[error("Unparsable store response from {url}: {detail}")]
    BadResponse { url: String, detail: String },

    #[error("Store rejected write of {id}: {reason}")]
    WriteRejected { id: String, reason: String },

    #[error("Atomic batch failed for {}: nothing was applied", .failed.join(", "))]
    AtomicBatch { failed: Vec<String> },

    #[error("Wrote {id} but the object hashed to {actual}")]
    HashMismatch { id: String, actual: String },

    #[error("Store operation not supported: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Git(#[from] ResolveError),
}

/// Any failure that aborts a replication run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Source resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gave up writing {id} after {attempts} conflicting attempts")]
    Contention { id: String, attempts: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),
}
