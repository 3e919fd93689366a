// src/aggregate.rs

//! Directory roll-ups of the per-file statistics.
//!
//! Directories live in a flat map keyed by normalized path (`""` is the
//! root). Each node knows its parent path and the names of its child
//! directories, so recomputation walks upward by path lookup instead of
//! through back-pointers.

use crate::model::StatsRecord;
use crate::store::{parent_dir, StatsStore};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// A file is a test when its name without extension starts or ends with
/// "test" or "tests", ignoring case.
pub fn is_test_file(path: &str) -> bool {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    stem.starts_with("test") || stem.ends_with("test") || stem.ends_with("tests")
}

/// Totals split into test and non-test members. For the files of one
/// directory `total` is `test + non_test`; a subtree partition adds up each
/// of its three fields separately.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Partition {
    pub total: StatsRecord,
    pub test: StatsRecord,
    pub non_test: StatsRecord,
}

impl Partition {
    fn from_parts(test: StatsRecord, non_test: StatsRecord) -> Self {
        Partition {
            total: test + non_test,
            test,
            non_test,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DirNode {
    parent: Option<String>,
    children: BTreeSet<String>,
    /// Files directly in this directory; `None` when there are none.
    direct: Option<Partition>,
    /// This directory plus every descendant; `None` when the subtree is empty.
    subtree: Option<Partition>,
}

fn depth(dir: &str) -> usize {
    if dir.is_empty() {
        0
    } else {
        dir.matches('/').count() + 1
    }
}

#[derive(Debug, Clone)]
pub struct AggregationTree {
    nodes: BTreeMap<String, DirNode>,
}

impl Default for AggregationTree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), DirNode::default());
        AggregationTree { nodes }
    }
}

impl AggregationTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes every directory from scratch.
    pub fn build(store: &StatsStore) -> Self {
        let mut tree = Self::new();
        let dirs: Vec<String> = store.dirs().map(String::from).collect();
        tree.recompute(store, dirs);
        tree
    }

    /// Aggregates of the files directly in `dir`.
    pub fn direct(&self, dir: &str) -> Option<&Partition> {
        self.nodes.get(dir).and_then(|n| n.direct.as_ref())
    }

    /// Aggregates of `dir` and all of its descendants.
    pub fn subtree(&self, dir: &str) -> Option<&Partition> {
        self.nodes.get(dir).and_then(|n| n.subtree.as_ref())
    }

    pub fn children(&self, dir: &str) -> impl Iterator<Item = &str> {
        self.nodes
            .get(dir)
            .into_iter()
            .flat_map(|n| n.children.iter().map(String::as_str))
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Recomputes the dirty directories and all of their ancestors from
    /// the store's current contents.
    ///
    /// Values are always summed afresh from the members, never patched
    /// with deltas. Returns every directory whose aggregates were
    /// recomputed, including ones that became empty and were dropped.
    pub fn recompute<I>(&mut self, store: &StatsStore, dirty: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut pending = BTreeSet::new();
        for dir in dirty {
            let mut current = dir;
            loop {
                self.ensure_node(&current);
                let parent = self.nodes.get(&current).and_then(|n| n.parent.clone());
                if !pending.insert(current) {
                    break;
                }
                match parent {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
        }

        let mut order: Vec<String> = pending.iter().cloned().collect();
        order.sort_by(|a, b| (Reverse(depth(a)), a).cmp(&(Reverse(depth(b)), b)));

        for dir in order {
            self.recompute_node(store, &dir);
        }
        pending
    }

    /// Creates `dir` and any missing ancestors, each linked into its
    /// parent's children. The root always exists.
    fn ensure_node(&mut self, dir: &str) {
        let mut current = dir.to_string();
        let mut child: Option<String> = None;
        loop {
            let exists = self.nodes.contains_key(&current);
            if !exists {
                self.nodes.insert(
                    current.clone(),
                    DirNode {
                        parent: Some(parent_dir(&current).to_string()),
                        ..DirNode::default()
                    },
                );
            }
            if let Some(name) = child.take() {
                if let Some(node) = self.nodes.get_mut(&current) {
                    node.children.insert(name);
                }
            }
            if exists || current.is_empty() {
                break;
            }
            let parent = parent_dir(&current).to_string();
            child = Some(std::mem::replace(&mut current, parent));
        }
    }

    fn recompute_node(&mut self, store: &StatsStore, dir: &str) {
        let mut test = StatsRecord::default();
        let mut non_test = StatsRecord::default();
        let mut members = 0usize;
        for (path, analysis) in store.files_in(dir) {
            members += 1;
            if is_test_file(path) {
                test += analysis.record;
            } else {
                non_test += analysis.record;
            }
        }
        let direct = (members > 0).then(|| Partition::from_parts(test, non_test));

        // SUBTREE(dir) = TOTAL(dir) + each child's SUBTREE, summed in child order.
        let mut subtree = direct;
        let Some(node) = self.nodes.get(dir) else {
            debug_assert!(false, "aggregation node '{dir}' missing");
            return;
        };
        for child in &node.children {
            if let Some(sub) = self.nodes.get(child).and_then(|c| c.subtree) {
                let acc = subtree.get_or_insert_with(Partition::default);
                acc.total += sub.total;
                acc.test += sub.test;
                acc.non_test += sub.non_test;
            }
        }

        let parent = node.parent.clone();
        let empty = subtree.is_none() && node.children.is_empty();
        match parent {
            Some(parent) if empty => {
                self.nodes.remove(dir);
                if let Some(p) = self.nodes.get_mut(&parent) {
                    p.children.remove(dir);
                }
            }
            _ => {
                if let Some(node) = self.nodes.get_mut(dir) {
                    node.direct = direct;
                    node.subtree = subtree;
                }
            }
        }
    }
}
