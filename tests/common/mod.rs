#![allow(dead_code)]

use git2::{ObjectType, Oid, Repository, Signature, Time, TreeWalkMode, TreeWalkResult};
use git_gradon::analyzer::AnalysisError;
use git_gradon::config::TrackingRules;
use git_gradon::ledger::ResumeLedger;
use git_gradon::model::{FileAnalysis, Grade, MethodStat, Metric, StatsRecord};
use git_gradon::snapshot::parse_stats;
use git_gradon::{CommitMirror, MirroredCommit, Replay, ReplayOptions, ReplayResult, SourceHistory};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const AUTHOR_OFFSET: i32 = -480;
pub const COMMITTER_OFFSET: i32 = 120;
const START_TIME: i64 = 1_487_483_205;

/// Stand-in for the external analyzer.
///
/// sloc is the number of non-blank lines and every such line adds one
/// logical line to the grade named by its first letter (`a`..`f`, default
/// A). A `def <name>` line reports a method. The Halstead volume is a tenth
/// of sloc so that sums are not exact in binary. Content containing
/// "syntax error" is unanalyzable.
pub fn fake_analyze(_path: &str, content: &[u8]) -> Result<FileAnalysis, AnalysisError> {
    let text = String::from_utf8_lossy(content);
    if text.contains("syntax error") {
        return Err(AnalysisError::Unanalyzable("syntax error".to_string()));
    }
    let mut record = StatsRecord::default();
    let mut methods = Vec::new();
    for line in text.lines() {
        record.stats.loc += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            record.stats.blank += 1;
            continue;
        }
        record.stats.sloc += 1;
        record.stats.lloc += 1;
        let grade = match trimmed.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('b') => Grade::B,
            Some('c') => Grade::C,
            Some('d') => Grade::D,
            Some('e') => Grade::E,
            Some('f') => Grade::F,
            _ => Grade::A,
        };
        record.grades.add_lines(grade, 1);
        if let Some(name) = trimmed.strip_prefix("def ") {
            record.complexity.func += 1;
            record.complexity.total += 1;
            methods.push(MethodStat {
                name: name.trim_end_matches(':').to_string(),
                grade,
                lloc: 1,
            });
        }
    }
    record.halstead.volume = Metric(record.stats.sloc as f64 * 0.1);
    Ok(FileAnalysis::new(record, methods))
}

/// `count` lines that the fake analyzer grades `grade`.
pub fn lines(count: usize, grade: char) -> String {
    (0..count).map(|i| format!("{grade}{i} = {i}\n")).collect()
}

pub fn options(range: Option<&str>) -> ReplayOptions {
    ReplayOptions {
        range: range.map(String::from),
        rules: TrackingRules::default(),
        jobs: 2,
    }
}

/// Runs a replay to completion with the fake analyzer.
pub fn replay<L: ResumeLedger>(
    source: &SourceHistory,
    mirror: &CommitMirror,
    ledger: &mut L,
    options: ReplayOptions,
) -> ReplayResult<Vec<MirroredCommit>> {
    Replay::start(source, mirror, ledger, &fake_analyze, options)?.collect()
}

/// Reads a file from a destination commit's tree.
pub fn read_at(mirror: &CommitMirror, commit: Oid, path: &str) -> Option<Vec<u8>> {
    let tree = mirror.tree_of(commit).unwrap();
    let entry = tree.get_path(Path::new(path)).ok()?;
    let blob = mirror.repo().find_blob(entry.id()).unwrap();
    Some(blob.content().to_vec())
}

pub fn stats_at(mirror: &CommitMirror, commit: Oid, path: &str) -> Option<StatsRecord> {
    read_at(mirror, commit, path).map(|bytes| parse_stats(&bytes).unwrap())
}

/// Every blob path of a tree, with content.
pub fn tree_files(repo: &Repository, commit: Oid) -> BTreeMap<String, Vec<u8>> {
    let tree = repo.find_commit(commit).unwrap().tree().unwrap();
    let mut files = BTreeMap::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            let blob = repo.find_blob(entry.id()).unwrap();
            files.insert(
                format!("{root}{}", entry.name().unwrap()),
                blob.content().to_vec(),
            );
        }
        TreeWalkResult::Ok
    })
    .unwrap();
    files
}

#[derive(Default)]
struct Dir {
    blobs: BTreeMap<String, Oid>,
    dirs: BTreeMap<String, Dir>,
}

/// A throwaway source repository whose commits are built straight from an
/// in-memory file map.
pub struct TestRepo {
    dir: TempDir,
    pub repo: Repository,
    files: BTreeMap<String, String>,
    clock: i64,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path().join("source")).unwrap();
        TestRepo {
            dir,
            repo,
            files: BTreeMap::new(),
            clock: START_TIME,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    /// A fresh destination path next to the source repository.
    pub fn dest(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn history(&self) -> SourceHistory {
        SourceHistory::open(&self.path()).unwrap()
    }

    pub fn write(&mut self, path: &str, content: impl Into<String>) -> &mut Self {
        self.files.insert(path.to_string(), content.into());
        self
    }

    pub fn remove(&mut self, path: &str) -> &mut Self {
        self.files.remove(path);
        self
    }

    pub fn rename(&mut self, from: &str, to: &str) -> &mut Self {
        if let Some(content) = self.files.remove(from) {
            self.files.insert(to.to_string(), content);
        }
        self
    }

    pub fn head(&self) -> Option<Oid> {
        self.repo.head().ok().and_then(|h| h.target())
    }

    pub fn commit(&mut self, message: &str) -> Oid {
        let parents: Vec<Oid> = self.head().into_iter().collect();
        self.commit_with(message, &parents, true)
    }

    /// Commits the current files on top of `parent` without moving HEAD.
    pub fn commit_detached(&mut self, message: &str, parent: Oid) -> Oid {
        self.commit_with(message, &[parent], false)
    }

    /// Commits the current files as a merge of HEAD and `other`.
    pub fn merge(&mut self, message: &str, other: Oid) -> Oid {
        let head = self.head().unwrap();
        self.commit_with(message, &[head, other], true)
    }

    /// Points the branch at `id` and takes over its files.
    pub fn reset_hard(&mut self, id: Oid) {
        let name = self.repo.head().unwrap().name().unwrap().to_string();
        self.repo.reference(&name, id, true, "test reset").unwrap();
        self.checkout_files(id);
    }

    /// Replaces the in-memory files with those of commit `id`.
    pub fn checkout_files(&mut self, id: Oid) {
        self.files = tree_files(&self.repo, id)
            .into_iter()
            .map(|(path, content)| (path, String::from_utf8(content).unwrap()))
            .collect();
    }

    fn commit_with(&mut self, message: &str, parents: &[Oid], update_head: bool) -> Oid {
        let mut root = Dir::default();
        for (path, content) in &self.files {
            let id = self.repo.blob(content.as_bytes()).unwrap();
            let mut parts: Vec<&str> = path.split('/').collect();
            let name = parts.pop().unwrap();
            let mut dir = &mut root;
            for part in parts {
                dir = dir.dirs.entry(part.to_string()).or_default();
            }
            dir.blobs.insert(name.to_string(), id);
        }
        let tree_id = write_dir(&self.repo, &root);
        let tree = self.repo.find_tree(tree_id).unwrap();

        let author = Signature::new("Alice", "alice@example.com", &Time::new(self.clock, AUTHOR_OFFSET)).unwrap();
        let committer =
            Signature::new("Bob", "bob@example.com", &Time::new(self.clock + 3600, COMMITTER_OFFSET)).unwrap();
        self.clock += 86_400;

        let parent_commits: Vec<git2::Commit<'_>> =
            parents.iter().map(|id| self.repo.find_commit(*id).unwrap()).collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();
        self.repo
            .commit(
                update_head.then_some("HEAD"),
                &author,
                &committer,
                message,
                &tree,
                &parent_refs,
            )
            .unwrap()
    }
}

fn write_dir(repo: &Repository, dir: &Dir) -> Oid {
    let mut builder = repo.treebuilder(None).unwrap();
    for (name, sub) in &dir.dirs {
        builder.insert(name, write_dir(repo, sub), 0o040000).unwrap();
    }
    for (name, id) in &dir.blobs {
        builder.insert(name, *id, 0o100644).unwrap();
    }
    builder.write().unwrap()
}
