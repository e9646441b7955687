//! Object model for replicated git content
//!
//! Every replicated unit is named by an [`ObjectRef`] and stored as a
//! [`Document`]. Ids are derived deterministically from the reference:
//!
//! - the branch list: `git-branches`
//! - a branch pointer: `git-branch-<name>`
//! - content: `git-<kind>-<sha1 hex>`
//!
//! Branch documents are mutable; commits, trees and blobs are content
//! addressed and never change once written.

use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::error::ModelError;

/// Prefix shared by every replicated document id.
pub const ID_PREFIX: &str = "git";

/// Number of hex characters in an object hash (SHA-1).
pub fn hash_hex_len() -> usize {
    <Sha1 as Digest>::output_size() * 2
}

/// Whether a store id belongs to the replicated namespace.
pub fn is_replicated_id(id: &str) -> bool {
    id.strip_prefix(ID_PREFIX)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// Content is text when it is valid UTF-8 without NUL bytes.
pub fn is_text(data: &[u8]) -> bool {
    !data.contains(&0) && std::str::from_utf8(data).is_ok()
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Branches,
    Branch,
    Commit,
    Tree,
    Blob,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Branches => "branches",
            ObjectKind::Branch => "branch",
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
        }
    }

    pub fn parse(name: &str) -> Result<Self, ModelError> {
        match name {
            "branches" => Ok(ObjectKind::Branches),
            "branch" => Ok(ObjectKind::Branch),
            "commit" => Ok(ObjectKind::Commit),
            "tree" => Ok(ObjectKind::Tree),
            "blob" => Ok(ObjectKind::Blob),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }

    /// Branch list and branch pointers may change between runs.
    pub fn is_mutable(&self) -> bool {
        matches!(self, ObjectKind::Branches | ObjectKind::Branch)
    }

    /// The `type` field stored on documents, e.g. `git-commit`.
    pub fn type_tag(&self) -> String {
        format!("{}-{}", ID_PREFIX, self.as_str())
    }

    pub fn from_type_tag(tag: &str) -> Result<Self, ModelError> {
        let name = tag
            .strip_prefix(ID_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| ModelError::UnknownKind(tag.to_string()))?;
        Self::parse(name)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hex-encoded SHA-1 of a commit, tree or blob, lowercase as git prints it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash(String);

impl ObjectHash {
    fn parse(kind: ObjectKind, hash: &str) -> Result<Self, ModelError> {
        let expected = hash_hex_len();
        let lower_hex = hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if hash.len() != expected || !lower_hex {
            return Err(ModelError::InvalidHash {
                kind,
                hash: hash.to_string(),
                expected,
            });
        }
        Ok(Self(hash.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one replicated unit of content.
///
/// Equality is structural (kind plus name) and the derived ordering is the
/// tie breaker the engine uses when two references share kind and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RefRecord", into = "RefRecord")]
pub enum ObjectRef {
    Branches,
    Branch(String),
    Commit(ObjectHash),
    Tree(ObjectHash),
    Blob(ObjectHash),
}

impl ObjectRef {
    /// The branch list, root of every replication run.
    pub const ROOT: ObjectRef = ObjectRef::Branches;

    pub fn branch(name: impl Into<String>) -> Result<Self, ModelError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ModelError::EmptyBranchName);
        }
        Ok(ObjectRef::Branch(name))
    }

    /// Reference a content-addressed object; `hash` must be full-length hex.
    pub fn content(kind: ObjectKind, hash: &str) -> Result<Self, ModelError> {
        let hash = ObjectHash::parse(kind, hash)?;
        match kind {
            ObjectKind::Commit => Ok(ObjectRef::Commit(hash)),
            ObjectKind::Tree => Ok(ObjectRef::Tree(hash)),
            ObjectKind::Blob => Ok(ObjectRef::Blob(hash)),
            other => Err(ModelError::NotContentKind(other)),
        }
    }

    pub fn commit(hash: &str) -> Result<Self, ModelError> {
        Self::content(ObjectKind::Commit, hash)
    }

    pub fn tree(hash: &str) -> Result<Self, ModelError> {
        Self::content(ObjectKind::Tree, hash)
    }

    pub fn blob(hash: &str) -> Result<Self, ModelError> {
        Self::content(ObjectKind::Blob, hash)
    }

    /// Decode a store id back into a reference.
    pub fn from_id(id: &str) -> Result<Self, ModelError> {
        let rest = id
            .strip_prefix(ID_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .ok_or_else(|| ModelError::MalformedId(id.to_string()))?;
        if rest == "branches" {
            return Ok(ObjectRef::Branches);
        }
        let (kind, name) = rest
            .split_once('-')
            .ok_or_else(|| ModelError::MalformedId(id.to_string()))?;
        match ObjectKind::parse(kind)? {
            ObjectKind::Branches => Err(ModelError::MalformedId(id.to_string())),
            ObjectKind::Branch => Self::branch(name),
            content => Self::content(content, name),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            ObjectRef::Branches => ObjectKind::Branches,
            ObjectRef::Branch(_) => ObjectKind::Branch,
            ObjectRef::Commit(_) => ObjectKind::Commit,
            ObjectRef::Tree(_) => ObjectKind::Tree,
            ObjectRef::Blob(_) => ObjectKind::Blob,
        }
    }

    /// Branch name or content hash; absent for the branch list.
    pub fn name(&self) -> Option<&str> {
        match self {
            ObjectRef::Branches => None,
            ObjectRef::Branch(name) => Some(name),
            ObjectRef::Commit(h) | ObjectRef::Tree(h) | ObjectRef::Blob(h) => Some(h.as_str()),
        }
    }

    pub fn hash(&self) -> Option<&ObjectHash> {
        match self {
            ObjectRef::Commit(h) | ObjectRef::Tree(h) | ObjectRef::Blob(h) => Some(h),
            _ => None,
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.kind().is_mutable()
    }

    /// Stable document id in the target store.
    pub fn id(&self) -> String {
        match self.name() {
            None => format!("{}-branches", ID_PREFIX),
            Some(name) => format!("{}-{}-{}", ID_PREFIX, self.kind(), name),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id())
    }
}

/// Wire shape of a reference: `{"_id", "type", "branch" | "sha"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefRecord {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

impl From<ObjectRef> for RefRecord {
    fn from(r: ObjectRef) -> Self {
        let id = r.id();
        let kind = r.kind().type_tag();
        match r {
            ObjectRef::Branches => RefRecord {
                id,
                kind,
                branch: None,
                sha: None,
            },
            ObjectRef::Branch(name) => RefRecord {
                id,
                kind,
                branch: Some(name),
                sha: None,
            },
            ObjectRef::Commit(h) | ObjectRef::Tree(h) | ObjectRef::Blob(h) => RefRecord {
                id,
                kind,
                branch: None,
                sha: Some(h.0),
            },
        }
    }
}

impl TryFrom<RefRecord> for ObjectRef {
    type Error = ModelError;

    fn try_from(record: RefRecord) -> Result<Self, Self::Error> {
        let kind = ObjectKind::from_type_tag(&record.kind)?;
        let reference = match kind {
            ObjectKind::Branches => ObjectRef::Branches,
            ObjectKind::Branch => {
                let name = record
                    .branch
                    .ok_or_else(|| ModelError::MalformedId(record.id.clone()))?;
                ObjectRef::branch(name)?
            }
            content => {
                let sha = record
                    .sha
                    .ok_or_else(|| ModelError::MalformedId(record.id.clone()))?;
                ObjectRef::content(content, &sha)?
            }
        };
        if reference.id() != record.id {
            return Err(ModelError::IdMismatch {
                id: reference.id(),
                stored: record.id,
            });
        }
        Ok(reference)
    }
}

/// Author or committer line of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// ISO-like date as printed by `git show --format=%ai`.
    pub date: String,
}

/// The set of branches currently present in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchList {
    pub branches: Vec<ObjectRef>,
}

/// A branch pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHead {
    pub branch: String,
    pub commit: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
    pub tree: ObjectRef,
    /// Sorted by hash.
    pub parents: Vec<ObjectRef>,
}

/// Directory tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub child: ObjectRef,
    pub basename: String,
    /// Symbolic mode, see [`crate::mode`].
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub sha: String,
    /// Sorted by the child's hash.
    pub children: Vec<TreeEntry>,
}

/// File content object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub sha: String,
    #[serde(flatten)]
    pub content: BlobContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "lowercase")]
pub enum BlobContent {
    Raw { raw: String },
    Base64 { base64: String },
}

impl BlobContent {
    /// Store text as-is and anything else base64 encoded.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        match String::from_utf8(data) {
            Ok(text) if !text.contains('\0') => BlobContent::Raw { raw: text },
            Ok(text) => BlobContent::Base64 {
                base64: base64::engine::general_purpose::STANDARD.encode(text),
            },
            Err(e) => BlobContent::Base64 {
                base64: base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        match self {
            BlobContent::Raw { raw } => Ok(raw.as_bytes().to_vec()),
            BlobContent::Base64 { base64 } => {
                Ok(base64::engine::general_purpose::STANDARD.decode(base64)?)
            }
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, BlobContent::Raw { .. })
    }
}

/// Stored representation of an [`ObjectRef`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    Branches(BranchList),
    Branch(BranchHead),
    Commit(Commit),
    Tree(Tree),
    Blob(Blob),
}

impl Document {
    /// The reference this document is stored under.
    pub fn object_ref(&self) -> Result<ObjectRef, ModelError> {
        match self {
            Document::Branches(_) => Ok(ObjectRef::Branches),
            Document::Branch(b) => ObjectRef::branch(b.branch.clone()),
            Document::Commit(c) => ObjectRef::commit(&c.sha),
            Document::Tree(t) => ObjectRef::tree(&t.sha),
            Document::Blob(b) => ObjectRef::blob(&b.sha),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Document::Branches(_) => ObjectKind::Branches,
            Document::Branch(_) => ObjectKind::Branch,
            Document::Commit(_) => ObjectKind::Commit,
            Document::Tree(_) => ObjectKind::Tree,
            Document::Blob(_) => ObjectKind::Blob,
        }
    }

    /// References that must be durable before this document is written.
    ///
    /// Commits yield their parents, then their tree.
    pub fn dependencies(&self) -> Box<dyn Iterator<Item = &ObjectRef> + '_> {
        match self {
            Document::Branches(list) => Box::new(list.branches.iter()),
            Document::Branch(head) => Box::new(std::iter::once(&head.commit)),
            Document::Commit(c) => Box::new(c.parents.iter().chain(std::iter::once(&c.tree))),
            Document::Tree(t) => Box::new(t.children.iter().map(|entry| &entry.child)),
            Document::Blob(_) => Box::new(std::iter::empty()),
        }
    }

    /// Check that nested references have the kinds their fields require.
    pub fn validate(&self) -> Result<(), ModelError> {
        let id = self.object_ref()?.id();
        let expect = |field: &'static str, r: &ObjectRef, expected: ObjectKind| {
            if r.kind() == expected {
                Ok(())
            } else {
                Err(ModelError::WrongReferenceKind {
                    id: id.clone(),
                    field,
                    expected: expected.as_str(),
                    found: r.kind(),
                })
            }
        };
        match self {
            Document::Branches(list) => {
                for b in &list.branches {
                    expect("branches", b, ObjectKind::Branch)?;
                }
            }
            Document::Branch(head) => expect("commit", &head.commit, ObjectKind::Commit)?,
            Document::Commit(c) => {
                expect("tree", &c.tree, ObjectKind::Tree)?;
                for p in &c.parents {
                    expect("parents", p, ObjectKind::Commit)?;
                }
            }
            Document::Tree(t) => {
                for entry in &t.children {
                    if !entry.child.kind().is_mutable() {
                        continue;
                    }
                    return Err(ModelError::WrongReferenceKind {
                        id: id.clone(),
                        field: "children",
                        expected: "commit, tree or blob",
                        found: entry.child.kind(),
                    });
                }
            }
            Document::Blob(_) => {}
        }
        Ok(())
    }

    /// Encode as the JSON object stored in the target.
    pub fn to_value(&self) -> Result<Value, ModelError> {
        let mut map = into_map(serde_json::to_value(self.object_ref()?)?);
        let body = match self {
            Document::Branches(list) => serde_json::to_value(list)?,
            Document::Branch(head) => serde_json::to_value(head)?,
            Document::Commit(c) => serde_json::to_value(c)?,
            Document::Tree(t) => serde_json::to_value(t)?,
            Document::Blob(b) => serde_json::to_value(b)?,
        };
        map.extend(into_map(body));
        Ok(Value::Object(map))
    }

    /// Decode a stored JSON object. Store bookkeeping such as `_rev` is ignored.
    pub fn from_value(value: &Value) -> Result<Self, ModelError> {
        let reference = ObjectRef::deserialize(value)?;
        let document = match reference.kind() {
            ObjectKind::Branches => Document::Branches(BranchList::deserialize(value)?),
            ObjectKind::Branch => Document::Branch(BranchHead::deserialize(value)?),
            ObjectKind::Commit => Document::Commit(Commit::deserialize(value)?),
            ObjectKind::Tree => Document::Tree(Tree::deserialize(value)?),
            ObjectKind::Blob => Document::Blob(Blob::deserialize(value)?),
        };
        document.validate()?;
        Ok(document)
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Document::from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn test_ids() {
        assert_eq!(ObjectRef::ROOT.id(), "git-branches");
        assert_eq!(ObjectRef::branch("master").unwrap().id(), "git-branch-master");
        assert_eq!(
            ObjectRef::commit(SHA_A).unwrap().id(),
            format!("git-commit-{}", SHA_A)
        );
    }

    #[test]
    fn test_hash_length_enforced() {
        assert_eq!(hash_hex_len(), 40);
        assert!(ObjectRef::blob("abc").is_err());
        assert!(ObjectRef::blob(&"z".repeat(40)).is_err());
        assert!(matches!(
            ObjectRef::content(ObjectKind::Branch, SHA_A),
            Err(ModelError::NotContentKind(ObjectKind::Branch))
        ));
    }

    #[test]
    fn test_from_id() {
        assert_eq!(ObjectRef::from_id("git-branches").unwrap(), ObjectRef::ROOT);
        assert_eq!(
            ObjectRef::from_id("git-branch-feature-x").unwrap(),
            ObjectRef::branch("feature-x").unwrap()
        );
        let tree = format!("git-tree-{}", SHA_B);
        assert_eq!(ObjectRef::from_id(&tree).unwrap(), ObjectRef::tree(SHA_B).unwrap());
        assert!(ObjectRef::from_id("_design/app").is_err());
        assert!(ObjectRef::from_id("git-tag-v1").is_err());
        assert!(ObjectRef::from_id("git-commit-short").is_err());
    }

    #[test]
    fn test_uppercase_hash_rejected() {
        let upper = SHA_A.to_ascii_uppercase();
        assert!(matches!(
            ObjectRef::blob(&upper),
            Err(ModelError::InvalidHash { .. })
        ));
        assert!(ObjectRef::from_id(&format!("git-blob-{}", upper)).is_err());

        let id = format!("git-blob-{}", SHA_A);
        assert_eq!(ObjectRef::from_id(&id).unwrap().id(), id);
    }

    #[test]
    fn test_replicated_id() {
        assert!(is_replicated_id("git-branches"));
        assert!(!is_replicated_id("_design/gitbrowser"));
        assert!(!is_replicated_id("gitx-branches"));
    }

    #[test]
    fn test_ref_json_shape() {
        let value = serde_json::to_value(ObjectRef::branch("master").unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"_id": "git-branch-master", "type": "git-branch", "branch": "master"})
        );
        let value = serde_json::to_value(ObjectRef::ROOT).unwrap();
        assert_eq!(value, json!({"_id": "git-branches", "type": "git-branches"}));
    }

    #[test]
    fn test_ref_id_mismatch_rejected() {
        let value = json!({"_id": "git-branch-other", "type": "git-branch", "branch": "master"});
        assert!(serde_json::from_value::<ObjectRef>(value).is_err());
    }

    #[test]
    fn test_commit_document_roundtrip() {
        let sig = Signature {
            name: "Alice".into(),
            email: "alice@example.com".into(),
            date: "2011-03-01 10:00:00 +0000".into(),
        };
        let doc = Document::Commit(Commit {
            sha: SHA_A.into(),
            author: sig.clone(),
            committer: sig,
            message: "Initial\n".into(),
            tree: ObjectRef::tree(SHA_B).unwrap(),
            parents: vec![],
        });
        let value = doc.to_value().unwrap();
        assert_eq!(value["_id"], json!(format!("git-commit-{}", SHA_A)));
        assert_eq!(value["type"], json!("git-commit"));
        assert_eq!(value["tree"]["type"], json!("git-tree"));

        let mut stored = value.clone();
        stored["_rev"] = json!("1-abc");
        assert_eq!(Document::from_value(&stored).unwrap(), doc);
    }

    #[test]
    fn test_commit_dependencies_parents_then_tree() {
        let sig = Signature {
            name: "a".into(),
            email: "a@b".into(),
            date: "d".into(),
        };
        let doc = Document::Commit(Commit {
            sha: SHA_A.into(),
            author: sig.clone(),
            committer: sig,
            message: String::new(),
            tree: ObjectRef::tree(SHA_A).unwrap(),
            parents: vec![ObjectRef::commit(SHA_B).unwrap()],
        });
        let deps: Vec<_> = doc.dependencies().cloned().collect();
        assert_eq!(
            deps,
            vec![ObjectRef::commit(SHA_B).unwrap(), ObjectRef::tree(SHA_A).unwrap()]
        );
        // Restartable: a second call yields the same sequence.
        assert_eq!(doc.dependencies().count(), 2);
    }

    #[test]
    fn test_wrong_reference_kind_rejected() {
        let value = json!({
            "_id": "git-branch-master",
            "type": "git-branch",
            "branch": "master",
            "commit": {"_id": format!("git-tree-{}", SHA_A), "type": "git-tree", "sha": SHA_A},
        });
        assert!(matches!(
            Document::from_value(&value),
            Err(ModelError::WrongReferenceKind { field: "commit", .. })
        ));
    }

    #[test]
    fn test_blob_encoding() {
        let text = BlobContent::from_bytes(b"hello".to_vec());
        assert_eq!(text, BlobContent::Raw { raw: "hello".into() });

        let binary: Vec<u8> = (0u8..=255).collect();
        let encoded = BlobContent::from_bytes(binary.clone());
        assert!(!encoded.is_raw());
        assert_eq!(encoded.to_bytes().unwrap(), binary);

        let blob = Document::Blob(Blob {
            sha: SHA_A.into(),
            content: encoded,
        });
        let value = blob.to_value().unwrap();
        assert_eq!(value["encoding"], json!("base64"));
        assert_eq!(Document::from_value(&value).unwrap(), blob);
    }

    #[test]
    fn test_is_text() {
        assert!(is_text(b"plain\ntext"));
        assert!(!is_text(b"nul\0inside"));
        assert!(!is_text(&[0xff, 0xfe]));
    }
}
