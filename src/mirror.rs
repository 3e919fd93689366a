// src/mirror.rs

//! Writes destination commits.

use crate::error::{ReplayError, ReplayResult};
use crate::ledger::ResumeEntry;
use crate::model::Identity;
use fs2::FileExt;
use git2::{ErrorCode, ObjectType, Oid, Repository, Signature, Sort, Time, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::{debug, info};

const BLOB_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;

/// Name of the advisory lock file in the destination's git directory.
pub const LOCK_FILE_NAME: &str = "gradon.lock";

/// Exclusive writer of the destination repository.
///
/// Holds an advisory lock for as long as it lives, so only one replay can
/// write to a destination at a time.
pub struct CommitMirror {
    repo: Repository,
    _lock: File,
}

#[derive(Default)]
struct DirEntries<'a> {
    blobs: BTreeMap<&'a str, Oid>,
    dirs: BTreeMap<&'a str, DirEntries<'a>>,
}

/// Pending changes to one directory; a `None` blob is a removal.
#[derive(Default)]
struct DirUpdates<'a> {
    blobs: BTreeMap<&'a str, Option<&'a [u8]>>,
    dirs: BTreeMap<&'a str, DirUpdates<'a>>,
}

fn signature(identity: &Identity) -> Result<Signature<'static>, git2::Error> {
    Signature::new(
        &identity.name,
        &identity.email,
        &Time::new(identity.time, identity.offset_minutes),
    )
}

impl CommitMirror {
    /// Opens the destination repository, creating a bare one if `path`
    /// does not hold a repository yet.
    pub fn open_or_init(path: &Path) -> ReplayResult<Self> {
        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                info!("Initializing destination repository at {}", path.display());
                std::fs::create_dir_all(path)?;
                Repository::init_bare(path)?
            }
            Err(e) => return Err(e.into()),
        };
        let lock_path = repo.path().join(LOCK_FILE_NAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| ReplayError::Locked(repo.path().to_path_buf()))?;
        Ok(CommitMirror { repo, _lock: lock })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// The commit the destination branch points at, if any.
    pub fn head(&self) -> Result<Option<Oid>, git2::Error> {
        match self.repo.head() {
            Ok(head) => Ok(head.target()),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// True when `ancestor` is `head` or reachable from it. Commits the
    /// destination does not have are not ancestors.
    pub fn is_ancestor(&self, ancestor: Oid, head: Oid) -> Result<bool, git2::Error> {
        if ancestor == head {
            return Ok(true);
        }
        match self.repo.graph_descendant_of(head, ancestor) {
            Ok(found) => Ok(found),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Moves the destination branch back to `to`, dropping later commits.
    pub fn reset_head(&self, to: Oid) -> Result<(), git2::Error> {
        let head = self.repo.head()?;
        let name = head.name().unwrap_or("HEAD").to_string();
        self.repo
            .reference(&name, to, true, "gradon: reset to last ledger entry")?;
        Ok(())
    }

    pub fn tree_of(&self, commit: Oid) -> Result<Tree<'_>, git2::Error> {
        self.repo.find_commit(commit)?.tree()
    }

    /// Creates a commit whose tree is exactly `files` on top of `parent`
    /// and advances the destination branch to it.
    ///
    /// With `changed`, only those paths are rewritten on top of the
    /// parent's tree; without it every file is written. Objects are written
    /// first and the branch is only moved once the commit object exists, so
    /// a crash leaves at most unreferenced objects behind. The branch update
    /// fails if the branch no longer points at `parent`.
    pub fn commit(
        &self,
        parent: Option<Oid>,
        files: &BTreeMap<String, Vec<u8>>,
        changed: Option<&BTreeSet<String>>,
        author: &Identity,
        committer: &Identity,
        message: &str,
    ) -> Result<Oid, git2::Error> {
        let tree_id = match (parent, changed) {
            (Some(parent), Some(changed)) => self.update_tree(parent, files, changed)?,
            _ => self.write_tree(files)?,
        };
        let tree = self.repo.find_tree(tree_id)?;
        let parent_commit = parent.map(|id| self.repo.find_commit(id)).transpose()?;
        let parents: Vec<&git2::Commit<'_>> = parent_commit.iter().collect();

        let id = self.repo.commit(
            Some("HEAD"),
            &signature(author)?,
            &signature(committer)?,
            message,
            &tree,
            &parents,
        )?;
        debug!("Wrote destination commit {} (tree {})", id, tree_id);
        Ok(id)
    }

    fn store_blob(&self, content: &[u8]) -> Result<Oid, git2::Error> {
        let id = Oid::hash_object(ObjectType::Blob, content)?;
        if !self.repo.odb()?.exists(id) {
            self.repo.blob(content)?;
        }
        Ok(id)
    }

    fn write_tree(&self, files: &BTreeMap<String, Vec<u8>>) -> Result<Oid, git2::Error> {
        let mut root = DirEntries::default();
        for (path, content) in files {
            let id = self.store_blob(content)?;
            let mut parts: Vec<&str> = path.split('/').collect();
            let name = parts.pop().unwrap_or_default();
            let mut dir = &mut root;
            for part in parts {
                dir = dir.dirs.entry(part).or_default();
            }
            dir.blobs.insert(name, id);
        }
        debug!("Wrote full tree of {} files", files.len());
        self.write_dir(&root)
    }

    fn write_dir(&self, dir: &DirEntries<'_>) -> Result<Oid, git2::Error> {
        let mut builder = self.repo.treebuilder(None)?;
        for (name, sub) in &dir.dirs {
            let id = self.write_dir(sub)?;
            builder.insert(name, id, TREE_MODE)?;
        }
        for (name, id) in &dir.blobs {
            builder.insert(name, *id, BLOB_MODE)?;
        }
        builder.write()
    }

    /// Applies the `changed` paths of `files` to the tree of `parent`.
    fn update_tree(
        &self,
        parent: Oid,
        files: &BTreeMap<String, Vec<u8>>,
        changed: &BTreeSet<String>,
    ) -> Result<Oid, git2::Error> {
        let base = self.tree_of(parent)?;
        let mut root = DirUpdates::default();
        for path in changed {
            let mut parts: Vec<&str> = path.split('/').collect();
            let name = parts.pop().unwrap_or_default();
            let mut dir = &mut root;
            for part in parts {
                dir = dir.dirs.entry(part).or_default();
            }
            dir.blobs.insert(name, files.get(path).map(Vec::as_slice));
        }
        debug!("Updating {} paths on top of {}", changed.len(), parent);
        match self.update_dir(Some(&base), &root)? {
            Some(id) => Ok(id),
            None => self.repo.treebuilder(None)?.write(),
        }
    }

    /// Returns `None` when the directory ends up empty.
    fn update_dir(&self, base: Option<&Tree<'_>>, updates: &DirUpdates<'_>) -> Result<Option<Oid>, git2::Error> {
        let mut builder = self.repo.treebuilder(base)?;
        for (name, sub) in &updates.dirs {
            let sub_base = match builder.get(*name)? {
                Some(entry) if entry.kind() == Some(ObjectType::Tree) => Some(self.repo.find_tree(entry.id())?),
                _ => None,
            };
            match self.update_dir(sub_base.as_ref(), sub)? {
                Some(id) => {
                    builder.insert(*name, id, TREE_MODE)?;
                }
                None => {
                    if builder.get(*name)?.is_some() {
                        builder.remove(*name)?;
                    }
                }
            }
        }
        for (name, content) in &updates.blobs {
            match content {
                Some(content) => {
                    let id = self.store_blob(content)?;
                    builder.insert(*name, id, BLOB_MODE)?;
                }
                None => {
                    if builder.get(*name)?.is_some() {
                        builder.remove(*name)?;
                    }
                }
            }
        }
        if builder.len() == 0 {
            return Ok(None);
        }
        builder.write().map(Some)
    }

    /// The destination's first-parent history, oldest first, as
    /// `(commit, message)` pairs.
    pub fn history(&self) -> Result<Vec<(Oid, String)>, git2::Error> {
        let Some(head) = self.head()? else {
            return Ok(Vec::new());
        };
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        revwalk.simplify_first_parent()?;
        revwalk.push(head)?;
        revwalk
            .map(|oid| {
                let oid = oid?;
                let commit = self.repo.find_commit(oid)?;
                Ok((oid, String::from_utf8_lossy(commit.message_bytes()).into_owned()))
            })
            .collect()
    }

    /// Recovers ledger entries from the destination history, whose commit
    /// messages start with the source commit id.
    pub fn ledger_entries(&self) -> ReplayResult<Vec<ResumeEntry>> {
        self.history()?
            .into_iter()
            .map(|(destination, message)| {
                let first = message.lines().next().unwrap_or_default().trim();
                let source = Some(first)
                    .filter(|s| s.len() == 40)
                    .and_then(|s| Oid::from_str(s).ok())
                    .ok_or_else(|| {
                        ReplayError::LedgerCorruption(format!(
                            "destination commit {destination} does not name a source commit"
                        ))
                    })?;
                Ok(ResumeEntry {
                    source,
                    destination,
                })
            })
            .collect()
    }
}
