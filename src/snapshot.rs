// src/snapshot.rs

//! The file layout of a destination commit.

use crate::aggregate::{AggregationTree, Partition};
use crate::error::{ReplayError, ReplayResult};
use crate::model::{ChangeRecord, Grade, LatestChangesTotal, MethodStat, StatsRecord};
use crate::store::StatsStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const STATS_SUFFIX: &str = ".stats.yaml";
pub const METHODS_SUFFIX: &str = ".methods.yaml";
pub const LATEST_CHANGES: &str = "LATEST_CHANGES.yaml";
pub const LATEST_CHANGES_TOTAL: &str = "LATEST_CHANGES_TOTAL.yaml";

/// The six aggregate files written per directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Total,
    TotalTest,
    TotalNonTest,
    SubtreeTotal,
    SubtreeTotalTest,
    SubtreeTotalNonTest,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 6] = [
        AggregateKind::Total,
        AggregateKind::TotalTest,
        AggregateKind::TotalNonTest,
        AggregateKind::SubtreeTotal,
        AggregateKind::SubtreeTotalTest,
        AggregateKind::SubtreeTotalNonTest,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AggregateKind::Total => "TOTAL",
            AggregateKind::TotalTest => "TOTAL_TEST",
            AggregateKind::TotalNonTest => "TOTAL_NON_TEST",
            AggregateKind::SubtreeTotal => "SUBTREE_TOTAL",
            AggregateKind::SubtreeTotalTest => "SUBTREE_TOTAL_TEST",
            AggregateKind::SubtreeTotalNonTest => "SUBTREE_TOTAL_NON_TEST",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    fn select(self, tree: &AggregationTree, dir: &str) -> Option<StatsRecord> {
        let pick = |p: &Partition, kind: AggregateKind| match kind {
            AggregateKind::Total | AggregateKind::SubtreeTotal => p.total,
            AggregateKind::TotalTest | AggregateKind::SubtreeTotalTest => p.test,
            AggregateKind::TotalNonTest | AggregateKind::SubtreeTotalNonTest => p.non_test,
        };
        match self {
            AggregateKind::Total | AggregateKind::TotalTest | AggregateKind::TotalNonTest => {
                tree.direct(dir).map(|p| pick(p, self))
            }
            _ => tree.subtree(dir).map(|p| pick(p, self)),
        }
    }
}

/// What a destination path holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact<'a> {
    /// `<file>.stats.yaml`, carrying the source file's path.
    FileStats(&'a str),
    /// `<file>.methods.yaml`, carrying the source file's path.
    FileMethods(&'a str),
    /// An aggregate file with the directory it belongs to.
    Aggregate(&'a str, AggregateKind),
    LatestChanges,
    LatestChangesTotal,
    Other,
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

pub fn stats_path(file: &str) -> String {
    format!("{file}{STATS_SUFFIX}")
}

pub fn methods_path(file: &str) -> String {
    format!("{file}{METHODS_SUFFIX}")
}

pub fn aggregate_path(dir: &str, kind: AggregateKind) -> String {
    join(dir, &format!("{}{STATS_SUFFIX}", kind.name()))
}

pub fn classify(path: &str) -> Artifact<'_> {
    match path {
        LATEST_CHANGES => return Artifact::LatestChanges,
        LATEST_CHANGES_TOTAL => return Artifact::LatestChangesTotal,
        _ => {}
    }
    if let Some(file) = path.strip_suffix(METHODS_SUFFIX) {
        return Artifact::FileMethods(file);
    }
    let Some(file) = path.strip_suffix(STATS_SUFFIX) else {
        return Artifact::Other;
    };
    let (dir, name) = file.rsplit_once('/').unwrap_or(("", file));
    match AggregateKind::from_name(name) {
        Some(kind) => Artifact::Aggregate(dir, kind),
        None => Artifact::FileStats(file),
    }
}

fn render<T: Serialize + ?Sized>(path: &str, value: &T) -> ReplayResult<Vec<u8>> {
    serde_yaml::to_string(value)
        .map(String::into_bytes)
        .map_err(|e| ReplayError::Artifact {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

pub fn parse_stats(bytes: &[u8]) -> Result<StatsRecord, serde_yaml::Error> {
    serde_yaml::from_slice(bytes)
}

type MethodEntry = BTreeMap<String, BTreeMap<Grade, i64>>;

fn methods_wire(methods: &[MethodStat]) -> Vec<MethodEntry> {
    methods
        .iter()
        .map(|m| {
            let mut grades = BTreeMap::new();
            grades.insert(m.grade, m.lloc);
            let mut entry = BTreeMap::new();
            entry.insert(m.name.clone(), grades);
            entry
        })
        .collect()
}

pub fn parse_methods(bytes: &[u8]) -> Result<Vec<MethodStat>, serde_yaml::Error> {
    let entries: Vec<MethodEntry> = serde_yaml::from_slice(bytes)?;
    Ok(entries
        .into_iter()
        .flat_map(|entry| {
            entry.into_iter().flat_map(|(name, grades)| {
                grades.into_iter().map(move |(grade, lloc)| MethodStat {
                    name: name.clone(),
                    grade,
                    lloc,
                })
            })
        })
        .collect())
}

/// The complete file set of the destination commit being built.
///
/// Kept across commits and patched only where the store or the
/// aggregation tree changed. The paths patched since the last
/// [`Snapshot::take_changes`] are remembered so the mirror can update its
/// parent tree instead of writing every file again.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    files: BTreeMap<String, Vec<u8>>,
    changed: BTreeSet<String>,
    /// Set until the first `take_changes` after a full render.
    rendered: bool,
}

impl Snapshot {
    /// Renders every artifact of the given state.
    pub fn render(store: &StatsStore, tree: &AggregationTree) -> ReplayResult<Self> {
        let mut snapshot = Snapshot {
            rendered: true,
            ..Snapshot::default()
        };
        for (path, _) in store.iter() {
            snapshot.refresh_file(store, path)?;
        }
        let dirs: Vec<String> = tree.dirs().map(String::from).collect();
        for dir in dirs {
            snapshot.refresh_dir(tree, &dir)?;
        }
        Ok(snapshot)
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Paths written or removed since the last call, or `None` right after
    /// a full render, when the whole file set has to be written.
    pub fn take_changes(&mut self) -> Option<BTreeSet<String>> {
        let changed = std::mem::take(&mut self.changed);
        if std::mem::replace(&mut self.rendered, false) {
            None
        } else {
            Some(changed)
        }
    }

    fn put(&mut self, path: String, bytes: Vec<u8>) {
        if self.files.get(&path) != Some(&bytes) {
            self.changed.insert(path.clone());
            self.files.insert(path, bytes);
        }
    }

    fn drop_path(&mut self, path: &str) {
        if self.files.remove(path).is_some() {
            self.changed.insert(path.to_string());
        }
    }

    /// Writes or removes the per-file artifacts of `file`.
    pub fn refresh_file(&mut self, store: &StatsStore, file: &str) -> ReplayResult<()> {
        let stats = stats_path(file);
        let methods = methods_path(file);
        match store.get(file) {
            Some(analysis) => {
                let bytes = render(&stats, &analysis.record)?;
                self.put(stats, bytes);
                if analysis.methods.is_empty() {
                    self.drop_path(&methods);
                } else {
                    let bytes = render(&methods, &methods_wire(&analysis.methods))?;
                    self.put(methods, bytes);
                }
            }
            None => {
                self.drop_path(&stats);
                self.drop_path(&methods);
            }
        }
        Ok(())
    }

    /// Writes or removes the six aggregate files of `dir`.
    pub fn refresh_dir(&mut self, tree: &AggregationTree, dir: &str) -> ReplayResult<()> {
        for kind in AggregateKind::ALL {
            let path = aggregate_path(dir, kind);
            match kind.select(tree, dir) {
                Some(record) => {
                    let bytes = render(&path, &record)?;
                    self.put(path, bytes);
                }
                None => self.drop_path(&path),
            }
        }
        Ok(())
    }

    pub fn set_latest_changes(
        &mut self,
        changes: &BTreeMap<String, ChangeRecord>,
        total: &LatestChangesTotal,
    ) -> ReplayResult<()> {
        let bytes = render(LATEST_CHANGES, changes)?;
        self.put(LATEST_CHANGES.to_string(), bytes);
        let bytes = render(LATEST_CHANGES_TOTAL, total)?;
        self.put(LATEST_CHANGES_TOTAL.to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileAnalysis;

    #[test]
    fn classifies_paths() {
        assert_eq!(classify("a/foo.py.stats.yaml"), Artifact::FileStats("a/foo.py"));
        assert_eq!(classify("foo.py.methods.yaml"), Artifact::FileMethods("foo.py"));
        assert_eq!(
            classify("a/b/SUBTREE_TOTAL_TEST.stats.yaml"),
            Artifact::Aggregate("a/b", AggregateKind::SubtreeTotalTest)
        );
        assert_eq!(classify("TOTAL.stats.yaml"), Artifact::Aggregate("", AggregateKind::Total));
        assert_eq!(classify("LATEST_CHANGES.yaml"), Artifact::LatestChanges);
        assert_eq!(classify("a/LATEST_CHANGES.yaml"), Artifact::Other);
        assert_eq!(classify("README"), Artifact::Other);
    }

    #[test]
    fn aggregate_paths() {
        assert_eq!(aggregate_path("", AggregateKind::Total), "TOTAL.stats.yaml");
        assert_eq!(
            aggregate_path("a/b", AggregateKind::SubtreeTotalNonTest),
            "a/b/SUBTREE_TOTAL_NON_TEST.stats.yaml"
        );
    }

    #[test]
    fn methods_round_trip_sorted() {
        let methods = vec![
            MethodStat { name: "Foo.bar".into(), grade: Grade::A, lloc: 3 },
            MethodStat { name: "helper".into(), grade: Grade::C, lloc: 11 },
        ];
        let bytes = render("x", &methods_wire(&methods)).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.find("Foo.bar").unwrap() < text.find("helper").unwrap());
        assert_eq!(parse_methods(&bytes).unwrap(), methods);
    }

    #[test]
    fn snapshot_tracks_store_and_tree() {
        let mut store = StatsStore::new();
        let mut record = StatsRecord::default();
        record.stats.sloc = 4;
        let methods = vec![MethodStat { name: "f".into(), grade: Grade::B, lloc: 4 }];
        store.insert("pkg/mod.py".into(), FileAnalysis::new(record, methods));
        let tree = AggregationTree::build(&store);
        let mut snapshot = Snapshot::render(&store, &tree).unwrap();

        let paths: Vec<_> = snapshot.files().keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            [
                "SUBTREE_TOTAL.stats.yaml",
                "SUBTREE_TOTAL_NON_TEST.stats.yaml",
                "SUBTREE_TOTAL_TEST.stats.yaml",
                "pkg/SUBTREE_TOTAL.stats.yaml",
                "pkg/SUBTREE_TOTAL_NON_TEST.stats.yaml",
                "pkg/SUBTREE_TOTAL_TEST.stats.yaml",
                "pkg/TOTAL.stats.yaml",
                "pkg/TOTAL_NON_TEST.stats.yaml",
                "pkg/TOTAL_TEST.stats.yaml",
                "pkg/mod.py.methods.yaml",
                "pkg/mod.py.stats.yaml",
            ]
        );
        let parsed = parse_stats(snapshot.get("pkg/TOTAL.stats.yaml").unwrap()).unwrap();
        assert_eq!(parsed.stats.sloc, 4);

        assert_eq!(snapshot.take_changes(), None);
        snapshot.refresh_dir(&tree, "pkg").unwrap();
        assert_eq!(snapshot.take_changes(), Some(BTreeSet::new()));

        store.remove("pkg/mod.py");
        snapshot.refresh_file(&store, "pkg/mod.py").unwrap();
        assert!(snapshot.get("pkg/mod.py.stats.yaml").is_none());
        assert!(snapshot.get("pkg/mod.py.methods.yaml").is_none());
        let changed = snapshot.take_changes().unwrap();
        assert_eq!(
            changed.iter().map(String::as_str).collect::<Vec<_>>(),
            ["pkg/mod.py.methods.yaml", "pkg/mod.py.stats.yaml"]
        );
    }
}
