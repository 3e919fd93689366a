// src/history.rs

use crate::model::{Identity, SourceCommit};
use git2::{
    Delta, DiffFindOptions, DiffOptions, ErrorCode, FileMode, Oid, Patch, Repository, Signature, Sort,
};
use std::path::Path;
use tracing::debug;

/// How a path changed between two commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

/// One changed file with its line counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub old_blob: Option<Oid>,
    pub new_blob: Option<Oid>,
    pub insertions: u64,
    pub deletions: u64,
}

impl FileChange {
    /// The path the change is reported under.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

/// The history of the repository being replayed.
pub struct SourceHistory {
    repo: Repository,
}

fn identity(sig: &Signature<'_>) -> Identity {
    Identity {
        name: String::from_utf8_lossy(sig.name_bytes()).into_owned(),
        email: String::from_utf8_lossy(sig.email_bytes()).into_owned(),
        time: sig.when().seconds(),
        offset_minutes: sig.when().offset_minutes(),
    }
}

fn is_regular_file(mode: FileMode) -> bool {
    matches!(mode, FileMode::Blob | FileMode::BlobExecutable)
}

fn path_of(file: &git2::DiffFile<'_>) -> Option<String> {
    file.path().and_then(|p| p.to_str()).map(String::from)
}

impl SourceHistory {
    pub fn open(path: &Path) -> Result<Self, git2::Error> {
        let repo = Repository::discover(path)?;
        debug!("Opened source repository at {}", repo.path().display());
        Ok(SourceHistory { repo })
    }

    pub fn from_repository(repo: Repository) -> Self {
        SourceHistory { repo }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.repo.workdir()
    }

    /// Resolves `A..B`, `B` or nothing (`HEAD`) into the commits to hide
    /// and the head to replay up to.
    pub fn resolve_range(&self, range: Option<&str>) -> Result<(Option<Oid>, Oid), git2::Error> {
        let resolve = |spec: &str| -> Result<Oid, git2::Error> {
            Ok(self.repo.revparse_single(spec)?.peel_to_commit()?.id())
        };
        match range {
            None => Ok((None, resolve("HEAD")?)),
            Some(range) => match range.split_once("..") {
                Some((start, stop)) => {
                    let start = (!start.is_empty()).then(|| resolve(start)).transpose()?;
                    let stop = resolve(if stop.is_empty() { "HEAD" } else { stop })?;
                    Ok((start, stop))
                }
                None => Ok((None, resolve(range)?)),
            },
        }
    }

    /// Commits reachable from `head` along first parents, oldest first,
    /// excluding everything reachable from `hide`.
    pub fn commits(&self, head: Oid, hide: &[Oid]) -> Result<Vec<Oid>, git2::Error> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        revwalk.simplify_first_parent()?;
        revwalk.push(head)?;
        for oid in hide {
            revwalk.hide(*oid)?;
        }
        revwalk.collect()
    }

    pub fn commit(&self, id: Oid) -> Result<SourceCommit, git2::Error> {
        let commit = self.repo.find_commit(id)?;
        let author = commit.author();
        let committer = commit.committer();
        let source = SourceCommit {
            id,
            parents: commit.parent_ids().collect(),
            author: identity(&author),
            committer: identity(&committer),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
        };
        Ok(source)
    }

    /// True when `ancestor` is `head` or reachable from it. Unknown commits
    /// are not ancestors.
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

    pub fn blob(&self, id: Oid) -> Result<Vec<u8>, git2::Error> {
        Ok(self.repo.find_blob(id)?.content().to_vec())
    }

    /// Number of lines in a text blob; binary blobs count as zero.
    fn line_count(&self, id: Oid) -> Result<u64, git2::Error> {
        let blob = self.repo.find_blob(id)?;
        if blob.is_binary() {
            return Ok(0);
        }
        let content = blob.content();
        let newlines = content.iter().filter(|&&b| b == b'\n').count() as u64;
        let unterminated = content.last().is_some_and(|&b| b != b'\n');
        Ok(newlines + u64::from(unterminated))
    }

    /// Regular files changed between `base` (the empty tree when `None`)
    /// and `commit`, restricted to changes where `keep` accepts the old or
    /// the new path.
    pub fn changes<F>(&self, base: Option<Oid>, commit: Oid, keep: F) -> Result<Vec<FileChange>, git2::Error>
    where
        F: Fn(&str) -> bool,
    {
        let new_tree = self.repo.find_commit(commit)?.tree()?;
        let old_tree = match base {
            Some(base) => Some(self.repo.find_commit(base)?.tree()?),
            None => None,
        };

        let mut diff_opts = DiffOptions::new();
        diff_opts.include_untracked(false);
        diff_opts.ignore_filemode(true);
        let mut diff = self
            .repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut diff_opts))?;
        let mut find_opts = DiffFindOptions::new();
        find_opts.renames(true);
        diff.find_similar(Some(&mut find_opts))?;

        let mut changes = Vec::new();
        for (idx, delta) in diff.deltas().enumerate() {
            let old_file = delta.old_file();
            let new_file = delta.new_file();
            let old_regular = is_regular_file(old_file.mode());
            let new_regular = is_regular_file(new_file.mode());

            let (kind, old_path, new_path) = match delta.status() {
                Delta::Added | Delta::Copied if new_regular => (ChangeKind::Added, None, path_of(&new_file)),
                Delta::Deleted if old_regular => (ChangeKind::Deleted, path_of(&old_file), None),
                Delta::Modified | Delta::Typechange => match (old_regular, new_regular) {
                    (true, true) => (ChangeKind::Modified, path_of(&old_file), path_of(&new_file)),
                    (true, false) => (ChangeKind::Deleted, path_of(&old_file), None),
                    (false, true) => (ChangeKind::Added, None, path_of(&new_file)),
                    (false, false) => continue,
                },
                Delta::Renamed if old_regular && new_regular => {
                    (ChangeKind::Renamed, path_of(&old_file), path_of(&new_file))
                }
                _ => continue,
            };

            let old_kept = old_path.as_deref().is_some_and(&keep);
            let new_kept = new_path.as_deref().is_some_and(&keep);
            if !old_kept && !new_kept {
                continue;
            }

            // A rename across the tracked boundary is a plain deletion or
            // addition of the whole file.
            if kind == ChangeKind::Renamed && old_kept != new_kept {
                let change = if old_kept {
                    FileChange {
                        kind: ChangeKind::Deleted,
                        old_blob: Some(old_file.id()),
                        new_blob: None,
                        old_path,
                        new_path: None,
                        insertions: 0,
                        deletions: self.line_count(old_file.id())?,
                    }
                } else {
                    FileChange {
                        kind: ChangeKind::Added,
                        old_blob: None,
                        new_blob: Some(new_file.id()),
                        old_path: None,
                        new_path,
                        insertions: self.line_count(new_file.id())?,
                        deletions: 0,
                    }
                };
                changes.push(change);
                continue;
            }

            let (insertions, deletions) = match Patch::from_diff(&diff, idx)? {
                Some(patch) => {
                    let (_, additions, removals) = patch.line_stats()?;
                    (additions as u64, removals as u64)
                }
                None => (0, 0),
            };

            changes.push(FileChange {
                kind,
                old_blob: old_path.as_ref().map(|_| old_file.id()),
                new_blob: new_path.as_ref().map(|_| new_file.id()),
                old_path,
                new_path,
                insertions,
                deletions,
            });
        }
        changes.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(changes)
    }
}
