// src/replay.rs

//! The replay loop: one destination commit per source commit.

use crate::aggregate::{is_test_file, AggregationTree};
use crate::analyzer::{analyze_batch, AnalysisError, Analyzer};
use crate::config::TrackingRules;
use crate::error::{ReplayError, ReplayResult};
use crate::history::{ChangeKind, FileChange, SourceHistory};
use crate::ledger::{ResumeEntry, ResumeLedger};
use crate::mirror::CommitMirror;
use crate::model::{ChangeRecord, FileAnalysis, LatestChangesTotal, SourceCommit, StatsRecord};
use crate::snapshot::Snapshot;
use crate::store::{parent_dir, StatsStore};
use git2::Oid;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Knobs of a replay run.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// `A..B`, `B`, or `None` for `HEAD`.
    pub range: Option<String>,
    pub rules: TrackingRules,
    /// Analyzer worker threads; 0 picks the number of CPUs.
    pub jobs: usize,
}

/// A file whose analysis failed at one commit.
#[derive(Debug)]
pub struct AnalysisFailure {
    pub path: String,
    pub error: AnalysisError,
}

/// The outcome of mirroring one source commit.
#[derive(Debug)]
pub struct MirroredCommit {
    pub source: SourceCommit,
    pub destination: Oid,
    pub changes: BTreeMap<String, ChangeRecord>,
    pub totals: LatestChangesTotal,
    /// Files left without statistics at this commit.
    pub failures: Vec<AnalysisFailure>,
}

/// What to do with one changed path.
enum Action {
    Remove,
    Migrate { from: String },
    Analyze { blob: Oid },
}

struct Planned {
    path: String,
    action: Action,
    change: ChangeRecord,
    before: Option<StatsRecord>,
    /// Old path to drop when a rename could not be migrated.
    drop_old: Option<String>,
}

/// Lazily replays source commits into the destination.
///
/// Each call to `next` processes exactly one source commit: diff, analyze,
/// aggregate, mirror, then append to the ledger. The first error ends the
/// sequence; running again with the same ledger picks up where it stopped.
pub struct Replay<'a, A: Analyzer + ?Sized, L: ResumeLedger> {
    source: &'a SourceHistory,
    mirror: &'a CommitMirror,
    ledger: &'a mut L,
    analyzer: &'a A,
    rules: TrackingRules,
    pool: ThreadPool,
    pending: VecDeque<Oid>,
    total: usize,
    /// Source commit the store currently reflects.
    base: Option<Oid>,
    /// Destination commit the next one is parented on.
    parent: Option<Oid>,
    store: StatsStore,
    tree: AggregationTree,
    snapshot: Snapshot,
    cancel: Option<Arc<AtomicBool>>,
    finished: bool,
}

impl<'a, A: Analyzer + ?Sized, L: ResumeLedger> Replay<'a, A, L> {
    /// Plans a run: validates the ledger against both histories and
    /// restores the statistics of the last mirrored commit.
    pub fn start(
        source: &'a SourceHistory,
        mirror: &'a CommitMirror,
        ledger: &'a mut L,
        analyzer: &'a A,
        options: ReplayOptions,
    ) -> ReplayResult<Self> {
        let (range_start, head) = source.resolve_range(options.range.as_deref())?;
        let mut hide: Vec<Oid> = range_start.into_iter().collect();

        let (base, parent, store) = match ledger.last() {
            Some(last) => {
                if !source.is_ancestor(last.source, head)? {
                    return Err(ReplayError::HistoryDivergence {
                        last_source: last.source,
                        head,
                    });
                }
                reconcile(mirror, last)?;
                hide.push(last.source);
                let tree = mirror.tree_of(last.destination)?;
                let store = StatsStore::load(mirror.repo(), &tree)?;
                info!(
                    "Resuming after {} ({} commits already mirrored)",
                    last.source,
                    ledger.len()
                );
                (Some(last.source), Some(last.destination), store)
            }
            None => {
                if let Some(existing) = mirror.head()? {
                    return Err(ReplayError::LedgerCorruption(format!(
                        "ledger is empty but the destination already has commit {existing}; \
                         rebuild the ledger or start from an empty destination"
                    )));
                }
                (None, None, StatsStore::new())
            }
        };

        let pending: VecDeque<Oid> = source
            .commits(head, &hide)?
            .into_iter()
            .filter(|id| !ledger.contains(*id))
            .collect();
        debug!("{} source commits to replay up to {}", pending.len(), head);

        let tree = AggregationTree::build(&store);
        let snapshot = Snapshot::render(&store, &tree)?;
        let mut pool = ThreadPoolBuilder::new();
        if options.jobs > 0 {
            pool = pool.num_threads(options.jobs);
        }
        let pool = pool
            .build()
            .map_err(|e| ReplayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        Ok(Replay {
            source,
            mirror,
            ledger,
            analyzer,
            rules: options.rules,
            pool,
            total: pending.len(),
            pending,
            base,
            parent,
            store,
            tree,
            snapshot,
            cancel: None,
            finished: false,
        })
    }

    /// Stops the run before the next commit once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Number of commits this run set out to replay.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn store(&self) -> &StatsStore {
        &self.store
    }

    pub fn tree(&self) -> &AggregationTree {
        &self.tree
    }

    fn step(&mut self, id: Oid) -> ReplayResult<MirroredCommit> {
        let commit = self.source.commit(id)?;
        let rules = &self.rules;
        let file_changes = self.source.changes(self.base, id, |p| rules.is_tracked(p))?;
        let planned = self.plan(file_changes);

        let mut jobs = Vec::new();
        for item in &planned {
            if let Action::Analyze { blob } = item.action {
                jobs.push((item.path.clone(), self.source.blob(blob)?));
            }
        }
        let mut results: BTreeMap<String, Result<FileAnalysis, AnalysisError>> =
            analyze_batch(&self.pool, self.analyzer, jobs).into_iter().collect();

        let mut dirty = BTreeSet::new();
        let mut touched_files = BTreeSet::new();
        let mut changes = BTreeMap::new();
        let mut totals = LatestChangesTotal::default();
        let mut failures = Vec::new();

        for Planned {
            path,
            action,
            mut change,
            before,
            drop_old,
        } in planned
        {
            if let Some(old) = drop_old {
                self.store.remove(&old);
                dirty.insert(parent_dir(&old).to_string());
                touched_files.insert(old);
            }
            match action {
                Action::Remove => {
                    self.store.remove(&path);
                }
                Action::Migrate { from } => {
                    self.store.rename(&from, &path);
                    dirty.insert(parent_dir(&from).to_string());
                    touched_files.insert(from);
                }
                Action::Analyze { .. } => match results.remove(&path) {
                    Some(Ok(analysis)) => {
                        self.store.insert(path.clone(), analysis);
                    }
                    Some(Err(error)) if error.is_transient() => {
                        warn!("Could not analyze '{}' at {}: {}", path, id, error);
                        self.store.remove(&path);
                        change.unanalyzable = true;
                        failures.push(AnalysisFailure {
                            path: path.clone(),
                            error,
                        });
                    }
                    Some(Err(error)) => return Err(ReplayError::Analyzer { path, error }),
                    None => {
                        debug_assert!(false, "missing analysis result for '{path}'");
                        self.store.remove(&path);
                    }
                },
            }

            let after = self.store.get(&path).map(|a| a.record);
            change.stats = after;
            change.delta = before.map(|b| after.unwrap_or_default() - b);
            let effective = after.unwrap_or_default() - before.unwrap_or_default();
            totals.total.record(&change, effective);
            if is_test_file(&path) {
                totals.test.record(&change, effective);
            } else {
                totals.non_test.record(&change, effective);
            }

            dirty.insert(parent_dir(&path).to_string());
            touched_files.insert(path.clone());
            changes.insert(path, change);
        }

        let touched_dirs = self.tree.recompute(&self.store, dirty);
        for file in &touched_files {
            self.snapshot.refresh_file(&self.store, file)?;
        }
        for dir in &touched_dirs {
            self.snapshot.refresh_dir(&self.tree, dir)?;
        }
        self.snapshot.set_latest_changes(&changes, &totals)?;

        let message = format!("{}\n{}", id, commit.message);
        let changed = self.snapshot.take_changes();
        let destination = self
            .mirror
            .commit(
                self.parent,
                self.snapshot.files(),
                changed.as_ref(),
                &commit.author,
                &commit.committer,
                &message,
            )
            .map_err(|error| ReplayError::MirrorWrite { commit: id, error })?;
        self.ledger.append(ResumeEntry {
            source: id,
            destination,
        })?;

        self.base = Some(id);
        self.parent = Some(destination);
        info!(
            "Mirrored {} as {} ({} changed, {} unanalyzable)",
            id,
            destination,
            changes.len(),
            failures.len()
        );
        Ok(MirroredCommit {
            source: commit,
            destination,
            changes,
            totals,
            failures,
        })
    }

    fn plan(&self, file_changes: Vec<FileChange>) -> Vec<Planned> {
        let mut planned = Vec::new();
        for fc in file_changes {
            let old_tracked = fc.old_path.as_deref().is_some_and(|p| self.rules.is_tracked(p));
            let new_tracked = fc.new_path.as_deref().is_some_and(|p| self.rules.is_tracked(p));
            let lines = fc.insertions + fc.deletions;
            let record = |deleted: bool| ChangeRecord {
                insertions: fc.insertions,
                deletions: fc.deletions,
                lines,
                deleted,
                ..ChangeRecord::default()
            };
            let before_of = |path: &str| self.store.get(path).map(|a| a.record);

            match (fc.kind, fc.old_path.clone(), fc.new_path.clone()) {
                (ChangeKind::Renamed, Some(old), Some(new)) if old_tracked && new_tracked => {
                    let before = before_of(&old);
                    let mut change = record(false);
                    change.renamed_from = Some(old.clone());
                    let same_content = fc.old_blob == fc.new_blob && before.is_some();
                    let (action, drop_old) = match fc.new_blob {
                        _ if same_content => (Action::Migrate { from: old }, None),
                        Some(blob) => (Action::Analyze { blob }, Some(old)),
                        None => (Action::Remove, Some(old)),
                    };
                    planned.push(Planned {
                        path: new,
                        action,
                        change,
                        before,
                        drop_old,
                    });
                }
                (_, Some(old), _) if old_tracked && !new_tracked => {
                    planned.push(Planned {
                        before: before_of(&old),
                        path: old,
                        action: Action::Remove,
                        change: record(true),
                        drop_old: None,
                    });
                }
                (_, old, Some(new)) if new_tracked => {
                    // A rename from an untracked path is a plain addition.
                    let before = match (fc.kind, old) {
                        (ChangeKind::Modified, Some(old)) => before_of(&old),
                        _ => None,
                    };
                    let action = match fc.new_blob {
                        Some(blob) => Action::Analyze { blob },
                        None => Action::Remove,
                    };
                    planned.push(Planned {
                        path: new,
                        action,
                        change: record(false),
                        before,
                        drop_old: None,
                    });
                }
                _ => {}
            }
        }
        planned
    }
}

/// Brings the destination branch in line with the ledger's last entry.
fn reconcile(mirror: &CommitMirror, last: ResumeEntry) -> ReplayResult<()> {
    match mirror.head()? {
        Some(head) if head == last.destination => Ok(()),
        Some(head) if mirror.is_ancestor(last.destination, head)? => {
            warn!(
                "Destination head {} is ahead of the ledger; resetting to {}",
                head, last.destination
            );
            mirror.reset_head(last.destination)?;
            Ok(())
        }
        Some(head) => Err(ReplayError::LedgerCorruption(format!(
            "destination head {head} does not descend from ledger entry {}",
            last.destination
        ))),
        None => Err(ReplayError::LedgerCorruption(format!(
            "destination has no commits but the ledger ends at {}",
            last.destination
        ))),
    }
}

impl<'a, A: Analyzer + ?Sized, L: ResumeLedger> Iterator for Replay<'a, A, L> {
    type Item = ReplayResult<MirroredCommit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.pending.is_empty() {
            self.finished = true;
            return None;
        }
        if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
            self.finished = true;
            return Some(Err(ReplayError::Interrupted));
        }
        let id = self.pending.pop_front()?;
        let result = self.step(id);
        if result.is_err() {
            self.finished = true;
        }
        Some(result)
    }
}
