//! Git repository access
//!
//! All git access goes through the `git` executable:
//! - [`GitRepo`] runs commands inside one repository and knows where its
//!   branches live (`refs/heads/` for a local checkout, `refs/remotes/origin/`
//!   for a fetched mirror)
//! - [`GitResolver`] turns references into documents by reading objects

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ResolveError;
use crate::mode::octal_to_symbolic;
use crate::object::{
    Blob, BlobContent, BranchHead, BranchList, Commit, Document, ObjectKind, ObjectRef, Signature,
    Tree, TreeEntry,
};
use crate::resolver::Resolver;

/// Namespace of local branches.
pub const LOCAL_BRANCHES: &str = "refs/heads/";

/// Namespace of branches fetched from the mirrored remote.
pub const MIRROR_BRANCHES: &str = "refs/remotes/origin/";

/// Default directory for fetched mirrors.
pub const DEFAULT_CACHE_ROOT: &str = "/tmp/gitcouchsynccache";

/// Result type for git operations
pub type GitResult<T> = std::result::Result<T, ResolveError>;

/// Encode arbitrary text as a C identifier.
///
/// ASCII letters and digits are kept, except for a leading digit. Every
/// other byte becomes `_` followed by two lowercase hex digits, so distinct
/// inputs always map to distinct identifiers.
pub fn encode_c_identifier(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, byte) in text.bytes().enumerate() {
        let keep = byte.is_ascii_alphabetic() || (i > 0 && byte.is_ascii_digit());
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

/// A git repository on disk.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
    branch_namespace: String,
}

impl GitRepo {
    /// Use an existing repository; branches are its local heads.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            branch_namespace: LOCAL_BRANCHES.to_string(),
        }
    }

    /// Create (or reuse) a repository at `dir`.
    pub async fn init(dir: impl Into<PathBuf>) -> GitResult<Self> {
        let repo = Self::open(dir);
        tokio::fs::create_dir_all(&repo.dir)
            .await
            .map_err(|source| ResolveError::Spawn {
                command: format!("init {}", repo.dir.display()),
                source,
            })?;
        repo.run(&["init", "--quiet"]).await?;
        Ok(repo)
    }

    /// Fetch `url` into a mirror below `cache_root` and read branches from it.
    ///
    /// The mirror directory is derived from the URL, so repeated calls reuse
    /// and incrementally update the same clone.
    pub async fn mirror(cache_root: &Path, url: &str) -> GitResult<Self> {
        let mut repo = Self::init(cache_root.join(encode_c_identifier(url))).await?;
        repo.branch_namespace = MIRROR_BRANCHES.to_string();

        let remotes = repo.run(&["remote"]).await?;
        for remote in String::from_utf8_lossy(&remotes).lines() {
            let remote = remote.trim();
            if !remote.is_empty() {
                repo.run(&["remote", "remove", remote]).await?;
            }
        }
        repo.run(&["remote", "add", "origin", url]).await?;
        tracing::info!(url, dir = %repo.dir.display(), "Fetching mirror");
        repo.run(&["fetch", "--quiet", "origin"]).await?;
        Ok(repo)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn branch_namespace(&self) -> &str {
        &self.branch_namespace
    }

    /// Full ref name of a branch, e.g. `refs/heads/master`.
    pub fn branch_ref(&self, name: &str) -> String {
        format!("{}{}", self.branch_namespace, name)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a command without checking its exit status.
    pub async fn try_run(&self, args: &[&str]) -> GitResult<Output> {
        tracing::trace!(dir = %self.dir.display(), "git {}", args.join(" "));
        self.command(args)
            .output()
            .await
            .map_err(|source| ResolveError::Spawn {
                command: args.join(" "),
                source,
            })
    }

    /// Run a command and return its stdout.
    pub async fn run(&self, args: &[&str]) -> GitResult<Vec<u8>> {
        let output = self.try_run(args).await?;
        check_status(args, output)
    }

    /// Run a command with `input` on stdin and extra environment variables.
    pub async fn run_with_input(
        &self,
        args: &[&str],
        input: &[u8],
        env: &[(&str, &str)],
    ) -> GitResult<Vec<u8>> {
        tracing::trace!(dir = %self.dir.display(), "git {}", args.join(" "));
        let spawn_error = |source| ResolveError::Spawn {
            command: args.join(" "),
            source,
        };
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }
        let mut child = cmd.spawn().map_err(spawn_error)?;

        // Feed stdin concurrently so a chatty child cannot block on stdout.
        let stdin = child.stdin.take();
        let input = input.to_vec();
        let writer = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output.map_err(spawn_error)?;
        if let Err(e) = written {
            if output.status.success() {
                return Err(spawn_error(e));
            }
        }
        check_status(args, output)
    }

    /// Names of the branches in this repository's namespace, sorted.
    pub async fn branch_names(&self) -> GitResult<Vec<String>> {
        let out = self
            .run(&["for-each-ref", "--format=%(refname)", self.branch_namespace.as_str()])
            .await?;
        let text = std::str::from_utf8(&out).map_err(|e| ResolveError::Unparsable {
            id: ObjectRef::ROOT.id(),
            what: "branch list",
            detail: e.to_string(),
        })?;
        let mut names: Vec<String> = text
            .lines()
            .filter_map(|line| line.strip_prefix(self.branch_namespace.as_str()))
            .filter(|name| !name.is_empty() && *name != "HEAD")
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Commit a branch points at, or `None` if the branch does not exist.
    pub async fn branch_commit(&self, name: &str) -> GitResult<Option<String>> {
        let rev = format!("{}^{{commit}}", self.branch_ref(name));
        let output = self
            .try_run(&["rev-parse", "--verify", "--quiet", rev.as_str()])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    /// Type of an object (`commit`, `tree`, `blob`, `tag`), `None` if absent.
    pub async fn object_type(&self, hash: &str) -> GitResult<Option<String>> {
        let output = self.try_run(&["cat-file", "-t", hash]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }
}

fn check_status(args: &[&str], output: Output) -> GitResult<Vec<u8>> {
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(ResolveError::CommandFailed {
            command: args.join(" "),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

const COMMIT_FORMAT: &str = "--format=format:%an%x00%ae%x00%ai%x00%cn%x00%ce%x00%ci%x00%T%x00%P%x00%B";

/// Resolves references by reading a git repository.
#[derive(Debug, Clone)]
pub struct GitResolver {
    repo: GitRepo,
}

impl GitResolver {
    pub fn new(repo: GitRepo) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    async fn branches(&self) -> GitResult<Document> {
        let branches = self
            .repo
            .branch_names()
            .await?
            .into_iter()
            .map(ObjectRef::branch)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Document::Branches(BranchList { branches }))
    }

    async fn branch(&self, reference: &ObjectRef, name: &str) -> GitResult<Document> {
        let sha = self
            .repo
            .branch_commit(name)
            .await?
            .ok_or_else(|| ResolveError::Missing(reference.id()))?;
        Ok(Document::Branch(BranchHead {
            branch: name.to_string(),
            commit: ObjectRef::commit(&sha)?,
        }))
    }

    /// Fail with `Missing` unless `hash` is present with the expected type.
    async fn expect_type(&self, reference: &ObjectRef, hash: &str) -> GitResult<()> {
        match self.repo.object_type(hash).await? {
            None => Err(ResolveError::Missing(reference.id())),
            Some(found) if found == reference.kind().as_str() => Ok(()),
            Some(found) => Err(ResolveError::Unparsable {
                id: reference.id(),
                what: "object type",
                detail: format!("object is a {}", found),
            }),
        }
    }

    async fn commit(&self, reference: &ObjectRef, sha: &str) -> GitResult<Document> {
        let out = self.repo.run(&["show", "-s", COMMIT_FORMAT, sha]).await?;
        let text = std::str::from_utf8(&out).map_err(|e| ResolveError::Unparsable {
            id: reference.id(),
            what: "commit",
            detail: e.to_string(),
        })?;
        let fields: Vec<&str> = text.splitn(9, '\0').collect();
        let [an, ae, ai, cn, ce, ci, tree, parents, message] = fields[..] else {
            return Err(ResolveError::Unparsable {
                id: reference.id(),
                what: "commit",
                detail: format!("expected 9 fields, got {}", fields.len()),
            });
        };

        let mut parents: Vec<&str> = parents.split_whitespace().collect();
        parents.sort_unstable();
        Ok(Document::Commit(Commit {
            sha: sha.to_string(),
            author: Signature {
                name: an.to_string(),
                email: ae.to_string(),
                date: ai.to_string(),
            },
            committer: Signature {
                name: cn.to_string(),
                email: ce.to_string(),
                date: ci.to_string(),
            },
            message: message.to_string(),
            tree: ObjectRef::tree(tree.trim())?,
            parents: parents
                .into_iter()
                .map(ObjectRef::commit)
                .collect::<Result<_, _>>()?,
        }))
    }

    async fn tree(&self, reference: &ObjectRef, sha: &str) -> GitResult<Document> {
        let out = self.repo.run(&["ls-tree", "-z", sha]).await?;
        let mut children = Vec::new();
        for record in out.split(|b| *b == 0).filter(|r| !r.is_empty()) {
            children.push(parse_tree_entry(reference, record)?);
        }
        children.sort_by(|a: &TreeEntry, b: &TreeEntry| a.child.name().cmp(&b.child.name()));
        Ok(Document::Tree(Tree {
            sha: sha.to_string(),
            children,
        }))
    }

    async fn blob(&self, sha: &str) -> GitResult<Document> {
        let data = self.repo.run(&["cat-file", "blob", sha]).await?;
        Ok(Document::Blob(Blob {
            sha: sha.to_string(),
            content: BlobContent::from_bytes(data),
        }))
    }
}

/// Parse one `ls-tree -z` record: `<mode> <type> <sha>\t<name>`.
fn parse_tree_entry(reference: &ObjectRef, record: &[u8]) -> GitResult<TreeEntry> {
    let unparsable = |detail: String| ResolveError::Unparsable {
        id: reference.id(),
        what: "tree entry",
        detail,
    };
    let tab = record
        .iter()
        .position(|b| *b == b'\t')
        .ok_or_else(|| unparsable(String::from_utf8_lossy(record).into_owned()))?;
    let meta = std::str::from_utf8(&record[..tab]).map_err(|e| unparsable(e.to_string()))?;
    let basename = std::str::from_utf8(&record[tab + 1..])
        .map_err(|e| {
            unparsable(format!(
                "name {:?} is not UTF-8: {}",
                String::from_utf8_lossy(&record[tab + 1..]),
                e
            ))
        })?
        .to_string();

    let mut parts = meta.split(' ');
    let (Some(mode), Some(kind), Some(hash), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(unparsable(meta.to_string()));
    };
    let kind = ObjectKind::parse(kind)?;
    Ok(TreeEntry {
        child: ObjectRef::content(kind, hash)?,
        basename,
        mode: octal_to_symbolic(mode)?,
    })
}

#[async_trait]
impl Resolver for GitResolver {
    async fn resolve(&self, reference: &ObjectRef) -> GitResult<Document> {
        match reference {
            ObjectRef::Branches => self.branches().await,
            ObjectRef::Branch(name) => self.branch(reference, name).await,
            ObjectRef::Commit(hash) => {
                self.expect_type(reference, hash.as_str()).await?;
                self.commit(reference, hash.as_str()).await
            }
            ObjectRef::Tree(hash) => {
                self.expect_type(reference, hash.as_str()).await?;
                self.tree(reference, hash.as_str()).await
            }
            ObjectRef::Blob(hash) => {
                self.expect_type(reference, hash.as_str()).await?;
                self.blob(hash.as_str()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_encode_c_identifier() {
        assert_eq!(encode_c_identifier("abc"), "abc");
        assert_eq!(encode_c_identifier("a1"), "a1");
        assert_eq!(encode_c_identifier("1a"), "_31a");
        assert_eq!(
            encode_c_identifier("git://host/r.git"),
            "git_3a_2f_2fhost_2fr_2egit"
        );
        // Escapes cannot collide with literal text.
        assert_ne!(encode_c_identifier("_"), encode_c_identifier("_5f"));
    }

    #[test]
    fn test_parse_tree_entry() {
        let tree = ObjectRef::tree(SHA).unwrap();
        let record = format!("100755 blob {}\trun me.sh", SHA);
        let entry = parse_tree_entry(&tree, record.as_bytes()).unwrap();
        assert_eq!(entry.child, ObjectRef::blob(SHA).unwrap());
        assert_eq!(entry.basename, "run me.sh");
        assert_eq!(entry.mode, "-rwxr-xr-x");

        let record = format!("160000 commit {}\tvendor", SHA);
        let entry = parse_tree_entry(&tree, record.as_bytes()).unwrap();
        assert_eq!(entry.child, ObjectRef::commit(SHA).unwrap());
        assert_eq!(entry.mode, "m---------");
    }

    #[test]
    fn test_parse_tree_entry_rejects_garbage() {
        let tree = ObjectRef::tree(SHA).unwrap();
        assert!(parse_tree_entry(&tree, b"no tab here").is_err());
        assert!(parse_tree_entry(&tree, b"100644 blob\tname").is_err());
        let record = format!("100644 tag {}\tname", SHA);
        assert!(parse_tree_entry(&tree, record.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_tree_entry_rejects_non_utf8_name() {
        let tree = ObjectRef::tree(SHA).unwrap();
        let mut record = format!("100644 blob {}\tcaf", SHA).into_bytes();
        record.extend_from_slice(b"\xe9.txt");
        assert!(matches!(
            parse_tree_entry(&tree, &record),
            Err(ResolveError::Unparsable { what: "tree entry", .. })
        ));
    }

    #[test]
    fn test_branch_refs() {
        let repo = GitRepo::open("/tmp/x");
        assert_eq!(repo.branch_ref("master"), "refs/heads/master");
        assert_eq!(repo.branch_namespace(), LOCAL_BRANCHES);
    }
}
