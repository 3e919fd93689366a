// src/analyzer.rs

//! Per-file metric computation.
//!
//! The metrics themselves come from an external tool. This module only
//! defines the boundary: an [`Analyzer`] turns file content into a
//! [`FileAnalysis`] or a per-file [`AnalysisError`].

use crate::model::{FileAnalysis, Grade, MethodStat, StatsRecord};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The content could not be analyzed, e.g. a syntax error.
    #[error("unanalyzable: {0}")]
    Unanalyzable(String),

    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("analyzer produced invalid output: {0}")]
    InvalidOutput(String),

    /// The analyzer program could not be started at all.
    #[error("cannot run analyzer '{program}': {error}")]
    Launch {
        program: String,
        #[source]
        error: std::io::Error,
    },
}

impl AnalysisError {
    /// Whether the failure only concerns this file at this commit.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AnalysisError::Launch { .. })
    }
}

/// Computes statistics for one file. Implementations keep no state
/// between calls and may be invoked from several threads at once.
pub trait Analyzer: Sync {
    fn analyze(&self, path: &str, content: &[u8]) -> Result<FileAnalysis, AnalysisError>;
}

impl<F> Analyzer for F
where
    F: Fn(&str, &[u8]) -> Result<FileAnalysis, AnalysisError> + Sync,
{
    fn analyze(&self, path: &str, content: &[u8]) -> Result<FileAnalysis, AnalysisError> {
        self(path, content)
    }
}

#[derive(Deserialize)]
struct Report {
    #[serde(flatten)]
    record: StatsRecord,
    #[serde(default)]
    methods: Vec<BTreeMap<String, BTreeMap<Grade, i64>>>,
}

/// Parses an analyzer report: a stats record plus an optional `methods`
/// list of `{name: {grade: lloc}}` entries.
pub fn parse_report(bytes: &[u8]) -> Result<FileAnalysis, AnalysisError> {
    let report: Report =
        serde_yaml::from_slice(bytes).map_err(|e| AnalysisError::InvalidOutput(e.to_string()))?;
    let mut methods = Vec::new();
    for entry in report.methods {
        for (name, grades) in entry {
            for (grade, lloc) in grades {
                methods.push(MethodStat {
                    name: name.clone(),
                    grade,
                    lloc,
                });
            }
        }
    }
    Ok(FileAnalysis::new(report.record, methods))
}

/// Runs an external program once per file.
///
/// The file content is written to the program's stdin and every `{path}`
/// in the arguments is replaced by the file's repository path. A zero exit
/// status with a YAML report on stdout is a success; anything else is an
/// unanalyzable file.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        CommandAnalyzer {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl Analyzer for CommandAnalyzer {
    fn analyze(&self, path: &str, content: &[u8]) -> Result<FileAnalysis, AnalysisError> {
        let args: Vec<String> = self.args.iter().map(|a| a.replace("{path}", path)).collect();
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| AnalysisError::Launch {
                program: self.program.clone(),
                error,
            })?;

        // Each pipe gets its own thread; the child must never stall on a full pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let content = content.to_vec();
            thread::spawn(move || {
                let _ = stdin.write_all(&content);
            });
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| AnalysisError::Unanalyzable(e.to_string()))? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                debug!("Analyzer timed out on '{}'", path);
                return Err(AnalysisError::Timeout(self.timeout));
            }
            thread::sleep(Duration::from_millis(5));
        };

        // A process left behind by the analyzer can hold the pipes open past
        // its exit; the output still has to arrive before the deadline.
        let collect = |rx: &Receiver<Vec<u8>>| match rx.recv_deadline(deadline) {
            Ok(buf) => Ok(buf),
            Err(RecvTimeoutError::Disconnected) => Ok(Vec::new()),
            Err(RecvTimeoutError::Timeout) => {
                debug!("Analyzer output for '{}' still open at the deadline", path);
                Err(AnalysisError::Timeout(self.timeout))
            }
        };
        let out = collect(&stdout)?;
        let err = collect(&stderr)?;

        if !status.success() {
            let message = String::from_utf8_lossy(&err).trim().to_string();
            return Err(AnalysisError::Unanalyzable(if message.is_empty() {
                format!("analyzer exited with {status}")
            } else {
                message
            }));
        }
        parse_report(&out)
    }
}

/// Reads a pipe to its end on a separate thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

/// Analyzes a batch of files on the pool.
///
/// Results come back in input order regardless of which worker finished
/// first.
pub fn analyze_batch<A: Analyzer + ?Sized>(
    pool: &ThreadPool,
    analyzer: &A,
    files: Vec<(String, Vec<u8>)>,
) -> Vec<(String, Result<FileAnalysis, AnalysisError>)> {
    pool.install(|| {
        files
            .into_par_iter()
            .map(|(path, content)| {
                debug!("Analyzing '{}' ({} bytes)", path, content.len());
                let result = analyzer.analyze(&path, &content);
                (path, result)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_report_with_methods() {
        let yaml = b"complexity:\n  total: 3\nstats:\n  sloc: 12\nmethods:\n- zeta:\n    B: 4\n- Foo.alpha:\n    A: 2\n";
        let analysis = parse_report(yaml).unwrap();
        assert_eq!(analysis.record.complexity.total, 3);
        assert_eq!(analysis.record.stats.sloc, 12);
        let names: Vec<_> = analysis.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Foo.alpha", "zeta"]);
        assert_eq!(analysis.methods[1].grade, Grade::B);
        assert_eq!(analysis.methods[1].lloc, 4);
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_report(b"- just\n- a list\n").unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidOutput(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn batch_preserves_input_order() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let analyzer = |path: &str, content: &[u8]| -> Result<FileAnalysis, AnalysisError> {
            if path.ends_with("bad.py") {
                return Err(AnalysisError::Unanalyzable("syntax".into()));
            }
            let mut record = StatsRecord::default();
            record.stats.loc = content.len() as i64;
            Ok(FileAnalysis::new(record, Vec::new()))
        };
        let files: Vec<_> = (0..32)
            .map(|i| (format!("f{i:02}.py"), vec![b'x'; i]))
            .chain(std::iter::once(("zz/bad.py".to_string(), Vec::new())))
            .collect();
        let results = analyze_batch(&pool, &analyzer, files);
        assert_eq!(results.len(), 33);
        for (i, (path, result)) in results.iter().take(32).enumerate() {
            assert_eq!(path, &format!("f{i:02}.py"));
            assert_eq!(result.as_ref().unwrap().record.stats.loc, i as i64);
        }
        assert!(results[32].1.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_analyzer_reads_stdout() {
        let analyzer = CommandAnalyzer::new("cat", Vec::new(), Duration::from_secs(10));
        let analysis = analyzer.analyze("a.py", b"stats:\n  sloc: 9\n").unwrap();
        assert_eq!(analysis.record.stats.sloc, 9);
    }

    #[cfg(unix)]
    #[test]
    fn command_analyzer_substitutes_path() {
        let analyzer = CommandAnalyzer::new(
            "sh",
            vec!["-c".into(), "echo \"# {path}\"; cat".into()],
            Duration::from_secs(10),
        );
        let analysis = analyzer.analyze("pkg/a.py", b"stats:\n  loc: 2\n").unwrap();
        assert_eq!(analysis.record.stats.loc, 2);
    }

    #[cfg(unix)]
    #[test]
    fn command_analyzer_failures() {
        let failing = CommandAnalyzer::new(
            "sh",
            vec!["-c".into(), "echo 'bad syntax' >&2; exit 1".into()],
            Duration::from_secs(10),
        );
        match failing.analyze("a.py", b"") {
            Err(AnalysisError::Unanalyzable(message)) => assert_eq!(message, "bad syntax"),
            other => panic!("unexpected {other:?}"),
        }

        let slow = CommandAnalyzer::new("sleep", vec!["5".into()], Duration::from_millis(100));
        assert!(matches!(slow.analyze("a.py", b""), Err(AnalysisError::Timeout(_))));

        // The shell exits at once but its background child keeps stdout open.
        let lingering = CommandAnalyzer::new(
            "sh",
            vec!["-c".into(), "sleep 5 & echo 'stats: {sloc: 1}'".into()],
            Duration::from_millis(300),
        );
        let started = Instant::now();
        assert!(matches!(lingering.analyze("a.py", b""), Err(AnalysisError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(4));

        let missing = CommandAnalyzer::new("/nonexistent/analyzer", Vec::new(), Duration::from_secs(1));
        let err = missing.analyze("a.py", b"").unwrap_err();
        assert!(!err.is_transient());
    }
}
