// src/store.rs

use crate::error::{ReplayError, ReplayResult};
use crate::model::FileAnalysis;
use crate::snapshot::{self, Artifact};
use git2::{ObjectType, Repository, Tree, TreeWalkMode, TreeWalkResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Returns the directory part of a normalized path, `""` for the root.
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// The current statistics of every tracked file, keyed by path.
#[derive(Debug, Default, Clone)]
pub struct StatsStore {
    files: BTreeMap<String, FileAnalysis>,
    /// Directory -> paths of the files directly inside it.
    dirs: BTreeMap<String, BTreeSet<String>>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileAnalysis> {
        self.files.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileAnalysis)> {
        self.files.iter().map(|(p, a)| (p.as_str(), a))
    }

    /// Files directly inside `dir`, in path order.
    pub fn files_in<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a str, &'a FileAnalysis)> + 'a {
        self.dirs
            .get(dir)
            .into_iter()
            .flatten()
            .filter_map(move |path| self.files.get(path).map(|a| (path.as_str(), a)))
    }

    /// Directories holding at least one file.
    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.dirs.keys().map(String::as_str)
    }

    pub fn insert(&mut self, path: String, analysis: FileAnalysis) -> Option<FileAnalysis> {
        self.dirs
            .entry(parent_dir(&path).to_string())
            .or_default()
            .insert(path.clone());
        self.files.insert(path, analysis)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileAnalysis> {
        let removed = self.files.remove(path)?;
        let dir = parent_dir(path);
        if let Some(members) = self.dirs.get_mut(dir) {
            members.remove(path);
            if members.is_empty() {
                self.dirs.remove(dir);
            }
        }
        Some(removed)
    }

    /// Moves a record to a new path without recomputing it.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.remove(from) {
            Some(analysis) => {
                self.insert(to.to_string(), analysis);
                true
            }
            None => false,
        }
    }

    /// Rebuilds the store from the per-file artifacts of a destination tree.
    pub fn load(repo: &Repository, tree: &Tree<'_>) -> ReplayResult<Self> {
        let mut blobs: Vec<(String, git2::Oid)> = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    blobs.push((format!("{root}{name}"), entry.id()));
                }
            }
            TreeWalkResult::Ok
        })?;

        let mut store = StatsStore::new();
        let mut methods = BTreeMap::new();
        for (path, oid) in blobs {
            match snapshot::classify(&path) {
                Artifact::FileStats(file) => {
                    let blob = repo.find_blob(oid)?;
                    let record = snapshot::parse_stats(blob.content()).map_err(|e| ReplayError::Artifact {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    store.insert(file.to_string(), FileAnalysis::new(record, Vec::new()));
                }
                Artifact::FileMethods(file) => {
                    let blob = repo.find_blob(oid)?;
                    let parsed = snapshot::parse_methods(blob.content()).map_err(|e| ReplayError::Artifact {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    methods.insert(file.to_string(), parsed);
                }
                _ => {}
            }
        }
        for (file, list) in methods {
            match store.files.get_mut(&file) {
                Some(analysis) => analysis.methods = list,
                None => debug!("Ignoring methods of '{}' which has no stats", file),
            }
        }
        debug!("Loaded {} stats records from destination tree", store.len());
        Ok(store)
    }
}
