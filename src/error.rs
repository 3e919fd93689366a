// src/error.rs

use crate::analyzer::AnalysisError;
use crate::ledger::LedgerError;
use git2::Oid;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that stop a replay run.
///
/// Per-file analysis failures are not in here: they are reported on the
/// mirrored commit and the run carries on.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("source history diverged: ledger entry {last_source} is not an ancestor of {head}; re-initialize the destination or its ledger")]
    HistoryDivergence { last_source: Oid, head: Oid },

    #[error("failed to write destination commit for {commit}: {error}")]
    MirrorWrite {
        commit: Oid,
        #[source]
        error: git2::Error,
    },

    #[error("ledger is inconsistent with the destination repository: {0}")]
    LedgerCorruption(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("destination repository {} is locked by another run", .0.display())]
    Locked(PathBuf),

    #[error("invalid stats artifact '{path}': {reason}")]
    Artifact { path: String, reason: String },

    #[error("analyzer failed on '{path}': {error}")]
    Analyzer {
        path: String,
        #[source]
        error: AnalysisError,
    },

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("replay interrupted")]
    Interrupted,
}

impl ReplayError {
    /// Short name of the failure kind, used in per-commit reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplayError::HistoryDivergence { .. } => "history-divergence",
            ReplayError::MirrorWrite { .. } => "mirror-write-failure",
            ReplayError::LedgerCorruption(_) => "ledger-corruption",
            ReplayError::Ledger(LedgerError::Corrupt { .. }) => "ledger-corruption",
            ReplayError::Ledger(_) => "ledger-io",
            ReplayError::Locked(_) => "locked",
            ReplayError::Artifact { .. } => "artifact",
            ReplayError::Analyzer { .. } => "analyzer",
            ReplayError::Git(_) => "git",
            ReplayError::Io(_) => "io",
            ReplayError::Interrupted => "interrupted",
        }
    }
}

pub type ReplayResult<T> = Result<T, ReplayError>;
