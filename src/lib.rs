//! git-gradon - code-quality history as a git repository
//!
//! Replays the commits of a source repository and, for each one, writes a
//! commit to a shadow repository whose tree holds per-file and
//! per-directory statistics as of that commit.

pub mod aggregate;
pub mod analyzer;
pub mod config;
pub mod error;
pub mod history;
pub mod ledger;
pub mod mirror;
pub mod model;
pub mod replay;
pub mod snapshot;
pub mod store;

pub use analyzer::{AnalysisError, Analyzer, CommandAnalyzer};
pub use error::{ReplayError, ReplayResult};
pub use history::SourceHistory;
pub use ledger::{FileLedger, MemoryLedger, ResumeEntry, ResumeLedger};
pub use mirror::CommitMirror;
pub use model::{FileAnalysis, StatsRecord};
pub use replay::{MirroredCommit, Replay, ReplayOptions};
