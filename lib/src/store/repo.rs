//! A content-addressed repository of filesystem trees.
//!
//! Layers and images are stored as *commits*: a metadata map plus an
//! optional tree.  Trees and commits are JSON documents addressed by the
//! SHA-256 of their serialized form; file content lives in `objects/`
//! addressed by the SHA-256 of a small header (file mode) plus the bytes,
//! so checkouts can hard-link objects and still carry the right mode.
//! Branches are plain files under `refs/` holding a commit digest.
//!
//! Layout:
//!
//! ```text
//! <repo>/config                    marks the repository, records the mode
//! <repo>/objects/<2 hex>/<62 hex>.{file,dirtree,commit}
//! <repo>/refs/<branch...>          one file per branch
//! <repo>/tmp/                      staging, same filesystem as objects/
//! ```

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// How file ownership is treated.  `BareUser` repositories are writable by
/// an unprivileged user and never record ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoMode {
    Bare,
    BareUser,
}

impl RepoMode {
    fn as_str(&self) -> &'static str {
        match self {
            RepoMode::Bare => "bare",
            RepoMode::BareUser => "bare-user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    File,
    DirTree,
    Commit,
}

impl ObjectKind {
    fn extension(&self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::DirTree => "dirtree",
            ObjectKind::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeEntry {
    name: String,
    kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tree {
    entries: Vec<TreeEntry>,
}

/// A commit: a metadata map and an optional content tree.
#[derive(Debug, Serialize, Deserialize)]
pub struct Commit {
    /// Free-form string metadata (`docker.manifest`, `docker.layer`, ...).
    pub metadata: BTreeMap<String, String>,
    /// Digest of the root tree; absent for metadata-only commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<String>,
    /// Creation time, UTC seconds.
    pub timestamp: i64,
}

/// An open repository.
#[derive(Debug)]
pub struct Repo {
    path: Utf8PathBuf,
    mode: RepoMode,
}

impl Repo {
    /// Initialize a new repository at `path`.
    #[context("Creating repository at {path}")]
    pub fn create(path: &Utf8Path, mode: RepoMode) -> Result<Repo> {
        for sub in ["objects", "refs", "tmp"] {
            std::fs::create_dir_all(path.join(sub))?;
        }
        let config = format!("[core]\nrepo_version=1\nmode={}\n", mode.as_str());
        std::fs::write(path.join("config"), config)?;
        Ok(Repo {
            path: path.to_owned(),
            mode,
        })
    }

    /// Open an existing repository; `<repo>/config` must exist.
    #[context("Opening repository at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Repo> {
        let config = std::fs::read_to_string(path.join("config"))
            .with_context(|| format!("No repository found at {path}"))?;
        let mode = config
            .lines()
            .find_map(|l| l.trim().strip_prefix("mode="))
            .map(str::trim);
        let mode = match mode {
            Some("bare-user") => RepoMode::BareUser,
            Some("bare") | None => RepoMode::Bare,
            Some(o) => bail!("Unsupported repository mode {o}"),
        };
        Ok(Repo {
            path: path.to_owned(),
            mode,
        })
    }

    pub fn open_or_create(path: &Utf8Path, mode: RepoMode) -> Result<Repo> {
        if path.join("config").exists() {
            Repo::open(path)
        } else {
            Repo::create(path, mode)
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn mode(&self) -> RepoMode {
        self.mode
    }

    /// A scratch directory on the repository filesystem, removed on drop.
    pub fn tempdir(&self) -> Result<tempfile::TempDir> {
        Ok(tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(self.path.join("tmp"))?)
    }

    fn object_path(&self, digest: &str, kind: ObjectKind) -> Utf8PathBuf {
        // A short digest can only come from a corrupted document; the
        // resulting path simply fails to resolve.
        let (prefix, rest) = digest.split_at(digest.len().min(2));
        self.path
            .join("objects")
            .join(prefix)
            .join(format!("{rest}.{}", kind.extension()))
    }

    fn write_object_bytes(&self, kind: ObjectKind, data: &[u8]) -> Result<String> {
        let digest = hex::encode(Sha256::digest(data));
        let target = self.object_path(&digest, kind);
        if !target.exists() {
            std::fs::create_dir_all(target.parent().unwrap())?;
            let mut tmp = tempfile::NamedTempFile::new_in(self.path.join("tmp"))?;
            tmp.write_all(data)?;
            tmp.persist(&target)
                .map_err(|e| anyhow!("Storing object {digest}: {e}"))?;
        }
        Ok(digest)
    }

    /// Store a regular file's content, folding the mode into the object
    /// identity so hard-linked checkouts carry the right permissions.
    fn write_file_object(&self, src: &Utf8Path, mode: u32) -> Result<String> {
        let mut f = std::fs::File::open(src).with_context(|| format!("Opening {src}"))?;
        let mut hasher = Sha256::new();
        hasher.update(format!("file\0{mode:o}\0").as_bytes());
        let mut tmp = tempfile::NamedTempFile::new_in(self.path.join("tmp"))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }
        let digest = hex::encode(hasher.finalize());
        let target = self.object_path(&digest, ObjectKind::File);
        if !target.exists() {
            std::fs::create_dir_all(target.parent().unwrap())?;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(mode))?;
            tmp.persist(&target)
                .map_err(|e| anyhow!("Storing object {digest}: {e}"))?;
        }
        Ok(digest)
    }

    /// Write a directory into the store and return its tree digest.
    ///
    /// Device, socket and FIFO entries are skipped, and every directory
    /// gets user-write set so later checkouts can process whiteouts.
    #[context("Writing directory {dir}")]
    pub fn write_directory(&self, dir: &Utf8Path) -> Result<String> {
        let mut names = Vec::new();
        for entry in dir.read_dir_utf8()? {
            names.push(entry?);
        }
        names.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        let mut entries = Vec::new();
        for entry in names {
            let name = entry.file_name().to_string();
            let meta = std::fs::symlink_metadata(entry.path())?;
            let ft = meta.file_type();
            if ft.is_fifo() || ft.is_socket() || ft.is_block_device() || ft.is_char_device() {
                continue;
            }
            if ft.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                let target = target
                    .to_str()
                    .ok_or_else(|| anyhow!("Non-UTF-8 symlink target under {dir}"))?
                    .to_string();
                entries.push(TreeEntry {
                    name,
                    kind: EntryKind::Symlink,
                    mode: None,
                    digest: None,
                    target: Some(target),
                });
            } else if ft.is_dir() {
                let digest = self.write_directory(entry.path())?;
                entries.push(TreeEntry {
                    name,
                    kind: EntryKind::Dir,
                    mode: Some((meta.permissions().mode() & 0o7777) | 0o200),
                    digest: Some(digest),
                    target: None,
                });
            } else {
                let mode = meta.permissions().mode() & 0o7777;
                let digest = self.write_file_object(entry.path(), mode)?;
                entries.push(TreeEntry {
                    name,
                    kind: EntryKind::File,
                    mode: Some(mode),
                    digest: Some(digest),
                    target: None,
                });
            }
        }
        let doc = serde_json::to_vec(&Tree { entries })?;
        self.write_object_bytes(ObjectKind::DirTree, &doc)
    }

    /// Write a commit object; `tree` of `None` makes a metadata-only commit.
    pub fn write_commit(
        &self,
        tree: Option<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let commit = Commit {
            metadata,
            tree,
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.write_object_bytes(ObjectKind::Commit, &serde_json::to_vec(&commit)?)
    }

    pub fn load_commit(&self, rev: &str) -> Result<Commit> {
        if rev.len() != 64 || !rev.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("Invalid commit revision: {rev}");
        }
        let path = self.object_path(rev, ObjectKind::Commit);
        let data =
            std::fs::read(&path).with_context(|| format!("No such commit: {rev}"))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Look up a single metadata key on a commit.
    pub fn commit_metadata(&self, rev: &str, key: &str) -> Result<Option<String>> {
        Ok(self.load_commit(rev)?.metadata.get(key).cloned())
    }

    fn load_tree(&self, digest: &str) -> Result<Tree> {
        let data = std::fs::read(self.object_path(digest, ObjectKind::DirTree))
            .with_context(|| format!("No such tree: {digest}"))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn ref_path(&self, branch: &str) -> Utf8PathBuf {
        self.path.join("refs").join(branch)
    }

    /// Resolve a branch to its commit, or `None` when it does not exist.
    pub fn resolve(&self, branch: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.ref_path(branch)) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading ref {branch}")),
        }
    }

    /// Set (or with `None`, delete) a branch immediately.
    #[context("Updating ref {branch}")]
    pub fn set_ref(&self, branch: &str, rev: Option<&str>) -> Result<()> {
        let path = self.ref_path(branch);
        match rev {
            Some(rev) => {
                std::fs::create_dir_all(path.parent().unwrap())?;
                let mut tmp = tempfile::NamedTempFile::new_in(self.path.join("tmp"))?;
                tmp.write_all(rev.as_bytes())?;
                tmp.persist(&path)
                    .map_err(|e| anyhow!("Updating ref {branch}: {e}"))?;
            }
            None => match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            },
        }
        Ok(())
    }

    /// Enumerate branches, optionally restricted to a `prefix` (which is
    /// matched on whole path components).
    pub fn list_refs(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        fn walk(dir: &Utf8Path, base: &str, out: &mut Vec<String>) -> Result<()> {
            if !dir.exists() {
                return Ok(());
            }
            for entry in dir.read_dir_utf8()? {
                let entry = entry?;
                let name = if base.is_empty() {
                    entry.file_name().to_string()
                } else {
                    format!("{base}/{}", entry.file_name())
                };
                if entry.file_type()?.is_dir() {
                    walk(entry.path(), &name, out)?;
                } else {
                    out.push(name);
                }
            }
            Ok(())
        }
        let mut refs = Vec::new();
        walk(&self.path.join("refs"), "", &mut refs)?;
        if let Some(prefix) = prefix {
            let prefix = prefix.trim_end_matches('/');
            refs.retain(|r| {
                r.strip_prefix(prefix)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            });
        }
        refs.sort();
        Ok(refs)
    }

    /// Begin a transaction.  Ref updates are staged and only become
    /// visible on [`Transaction::commit`]; dropping the transaction
    /// aborts, leaving no new branches behind.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            repo: self,
            refs: Vec::new(),
        }
    }

    /// Check out a commit into `dest` with union semantics: later
    /// checkouts into the same directory overwrite earlier content, and
    /// `.wh.NAME` whiteout entries delete `NAME` instead of materializing.
    #[context("Checking out {rev}")]
    pub fn checkout_commit(&self, rev: &str, dest: &Utf8Path) -> Result<()> {
        let commit = self.load_commit(rev)?;
        let tree = commit
            .tree
            .ok_or_else(|| anyhow!("Commit {rev} has no content to check out"))?;
        std::fs::create_dir_all(dest)?;
        self.checkout_tree_at(&tree, dest)
    }

    fn checkout_tree_at(&self, tree_digest: &str, dest: &Utf8Path) -> Result<()> {
        let tree = self.load_tree(tree_digest)?;
        let entry_digest = |e: &TreeEntry| {
            e.digest
                .clone()
                .ok_or_else(|| anyhow!("Corrupted tree {tree_digest}: {} has no digest", e.name))
        };
        for entry in &tree.entries {
            let target = dest.join(&entry.name);
            match entry.kind {
                EntryKind::Dir => {
                    if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                        remove_any(&target)?;
                    }
                    if !target.is_dir() {
                        std::fs::create_dir(&target)?;
                    }
                    if let Some(mode) = entry.mode {
                        std::fs::set_permissions(
                            &target,
                            std::fs::Permissions::from_mode(mode | 0o200),
                        )?;
                    }
                    self.checkout_tree_at(&entry_digest(entry)?, &target)?;
                }
                EntryKind::File => {
                    if let Some(hidden) = entry.name.strip_prefix(".wh.") {
                        remove_any(&dest.join(hidden))?;
                        continue;
                    }
                    remove_any(&target)?;
                    let object = self.object_path(&entry_digest(entry)?, ObjectKind::File);
                    if std::fs::hard_link(&object, &target).is_err() {
                        // Cross-device or privilege failure; fall back to a copy.
                        std::fs::copy(&object, &target)?;
                        if let Some(mode) = entry.mode {
                            std::fs::set_permissions(
                                &target,
                                std::fs::Permissions::from_mode(mode),
                            )?;
                        }
                    }
                }
                EntryKind::Symlink => {
                    remove_any(&target)?;
                    let link_target = entry.target.as_deref().ok_or_else(|| {
                        anyhow!("Corrupted tree {tree_digest}: {} has no target", entry.name)
                    })?;
                    std::os::unix::fs::symlink(link_target, &target)?;
                }
            }
        }
        Ok(())
    }

    fn mark_commit(&self, rev: &str, reachable: &mut HashSet<Utf8PathBuf>) -> Result<()> {
        let commit = self.load_commit(rev)?;
        if !reachable.insert(self.object_path(rev, ObjectKind::Commit)) {
            return Ok(());
        }
        if let Some(tree) = &commit.tree {
            self.mark_tree(tree, reachable)?;
        }
        Ok(())
    }

    fn mark_tree(&self, digest: &str, reachable: &mut HashSet<Utf8PathBuf>) -> Result<()> {
        if !reachable.insert(self.object_path(digest, ObjectKind::DirTree)) {
            return Ok(());
        }
        let tree = self.load_tree(digest)?;
        for entry in &tree.entries {
            match (entry.kind, entry.digest.as_deref()) {
                (EntryKind::Dir, Some(d)) => self.mark_tree(d, reachable)?,
                (EntryKind::File, Some(d)) => {
                    reachable.insert(self.object_path(d, ObjectKind::File));
                }
                (EntryKind::Symlink, _) => {}
                (kind, None) => {
                    bail!("Corrupted tree {digest}: {:?} entry {} has no digest", kind, entry.name)
                }
            }
        }
        Ok(())
    }

    /// Delete every object not reachable from a branch.  Returns the
    /// number of objects removed.
    #[context("Pruning repository")]
    pub fn prune(&self) -> Result<u64> {
        let mut reachable = HashSet::new();
        for branch in self.list_refs(None)? {
            if let Some(rev) = self.resolve(&branch)? {
                self.mark_commit(&rev, &mut reachable)?;
            }
        }
        let mut removed = 0;
        let objects = self.path.join("objects");
        for prefix in objects.read_dir_utf8()? {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir() {
                continue;
            }
            for object in prefix.path().read_dir_utf8()? {
                let object = object?;
                if !reachable.contains(object.path()) {
                    std::fs::remove_file(object.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Copy a branch and its object closure from another repository on
    /// the local filesystem, then bind the same branch here.
    #[context("Pulling {branch} from {}", src.path())]
    pub fn pull_local(&self, src: &Repo, branch: &str) -> Result<String> {
        let rev = src
            .resolve(branch)?
            .ok_or_else(|| anyhow!("No such branch in source repository: {branch}"))?;
        let mut closure = HashSet::new();
        src.mark_commit(&rev, &mut closure)?;
        for object in closure {
            let rel = object
                .strip_prefix(src.path())
                .map_err(|_| anyhow!("Object {object} outside source repository"))?;
            let dest = self.path.join(rel);
            if dest.exists() {
                continue;
            }
            std::fs::create_dir_all(dest.parent().unwrap())?;
            if std::fs::hard_link(&object, &dest).is_err() {
                let mut tmp = tempfile::NamedTempFile::new_in(self.path.join("tmp"))?;
                let mut f = std::fs::File::open(&object)?;
                std::io::copy(&mut f, &mut tmp)?;
                let mode = std::fs::metadata(&object)?.permissions();
                tmp.as_file().set_permissions(mode)?;
                tmp.persist(&dest)
                    .map_err(|e| anyhow!("Storing object {rel}: {e}"))?;
            }
        }
        self.set_ref(branch, Some(&rev))?;
        Ok(rev)
    }
}

/// Staged ref updates, applied atomically-enough at commit: objects are
/// already content-addressed on disk, so visibility is controlled purely
/// by when the refs are written.
#[derive(Debug)]
pub struct Transaction<'a> {
    repo: &'a Repo,
    refs: Vec<(String, String)>,
}

impl Transaction<'_> {
    pub fn set_ref(&mut self, branch: &str, rev: &str) {
        self.refs.push((branch.to_string(), rev.to_string()));
    }

    pub fn commit(self) -> Result<()> {
        for (branch, rev) in &self.refs {
            self.repo.set_ref(branch, Some(rev))?;
        }
        Ok(())
    }
}

fn remove_any(path: &Utf8Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Inspecting {path}")),
    }
    Ok(())
}
