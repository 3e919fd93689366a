// src/ledger.rs

//! Durable record of which source commits have been mirrored.

use git2::Oid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// File name of the ledger inside the destination's git directory.
pub const LEDGER_FILE_NAME: &str = "gradon-ledger.jsonl";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger corruption at {}:{line}: {reason}", .path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("ledger io error on {}: {error}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

/// Proof that `source` has been fully mirrored as `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeEntry {
    pub source: Oid,
    pub destination: Oid,
}

#[derive(Serialize, Deserialize)]
struct Line {
    source: String,
    destination: String,
}

impl From<ResumeEntry> for Line {
    fn from(entry: ResumeEntry) -> Self {
        Line {
            source: entry.source.to_string(),
            destination: entry.destination.to_string(),
        }
    }
}

/// Append-only mapping from source commit to destination commit.
pub trait ResumeLedger {
    /// The most recently appended entry.
    fn last(&self) -> Option<ResumeEntry>;

    fn contains(&self, source: Oid) -> bool;

    /// Records a mirrored commit. Must only be called once the destination
    /// commit is durable.
    fn append(&mut self, entry: ResumeEntry) -> Result<(), LedgerError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A ledger that lives only as long as the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    entries: Vec<ResumeEntry>,
    seen: HashSet<Oid>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ResumeEntry] {
        &self.entries
    }
}

impl ResumeLedger for MemoryLedger {
    fn last(&self) -> Option<ResumeEntry> {
        self.entries.last().copied()
    }

    fn contains(&self, source: Oid) -> bool {
        self.seen.contains(&source)
    }

    fn append(&mut self, entry: ResumeEntry) -> Result<(), LedgerError> {
        self.seen.insert(entry.source);
        self.entries.push(entry);
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A JSON-lines ledger file, fsynced after every append.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    memory: MemoryLedger,
}

impl FileLedger {
    /// Opens the ledger at `path`; a missing file is an empty ledger.
    ///
    /// A final line without its newline is the remains of an interrupted
    /// append and is cut off. Any other unreadable line is corruption.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let io_err = |error| LedgerError::Io {
            path: path.clone(),
            error,
        };
        let mut memory = MemoryLedger::new();
        if !path.exists() {
            return Ok(FileLedger { path, memory });
        }

        let file = File::open(&path).map_err(io_err)?;
        let mut reader = BufReader::new(file);
        let mut buf = String::new();
        let mut offset = 0u64;
        let mut number = 0usize;
        loop {
            buf.clear();
            let read = reader.read_line(&mut buf).map_err(io_err)?;
            if read == 0 {
                break;
            }
            number += 1;
            if !buf.ends_with('\n') {
                warn!(
                    "Discarding incomplete ledger line {} in {}",
                    number,
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(&path).map_err(io_err)?;
                file.set_len(offset).map_err(io_err)?;
                file.sync_all().map_err(io_err)?;
                break;
            }
            offset += read as u64;
            let text = buf.trim();
            if text.is_empty() {
                continue;
            }
            let corrupt = |reason: String| LedgerError::Corrupt {
                path: path.clone(),
                line: number,
                reason,
            };
            let line: Line = serde_json::from_str(text).map_err(|e| corrupt(e.to_string()))?;
            let source = Oid::from_str(&line.source).map_err(|e| corrupt(e.to_string()))?;
            let destination = Oid::from_str(&line.destination).map_err(|e| corrupt(e.to_string()))?;
            if memory.contains(source) {
                return Err(corrupt(format!("duplicate entry for {source}")));
            }
            memory.append(ResumeEntry { source, destination })?;
        }
        Ok(FileLedger { path, memory })
    }

    /// Replaces the ledger with `entries`, written to a temporary file and
    /// renamed into place.
    pub fn rewrite(path: impl Into<PathBuf>, entries: &[ResumeEntry]) -> Result<Self, LedgerError> {
        let path = path.into();
        let io_err = |error| LedgerError::Io {
            path: path.clone(),
            error,
        };
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp).map_err(io_err)?;
            for entry in entries {
                let json = serde_json::to_string(&Line::from(*entry)).map_err(|e| io_err(e.into()))?;
                writeln!(file, "{json}").map_err(io_err)?;
            }
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, &path).map_err(io_err)?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ResumeEntry] {
        self.memory.entries()
    }
}

impl ResumeLedger for FileLedger {
    fn last(&self) -> Option<ResumeEntry> {
        self.memory.last()
    }

    fn contains(&self, source: Oid) -> bool {
        self.memory.contains(source)
    }

    fn append(&mut self, entry: ResumeEntry) -> Result<(), LedgerError> {
        let io_err = |error| LedgerError::Io {
            path: self.path.clone(),
            error,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let json = serde_json::to_string(&Line::from(entry)).map_err(|e| io_err(e.into()))?;
        file.write_all(format!("{json}\n").as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        self.memory.append(entry)
    }

    fn len(&self) -> usize {
        self.memory.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> Oid {
        Oid::from_bytes(&[n; 20]).unwrap()
    }

    fn entry(n: u8) -> ResumeEntry {
        ResumeEntry {
            source: oid(n),
            destination: oid(n + 100),
        }
    }

    #[test]
    fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);

        let mut ledger = FileLedger::open(&path).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.last(), None);
        ledger.append(entry(1)).unwrap();
        ledger.append(entry(2)).unwrap();

        let reopened = FileLedger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.last(), Some(entry(2)));
        assert!(reopened.contains(oid(1)));
        assert!(!reopened.contains(oid(3)));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let mut ledger = FileLedger::open(&path).unwrap();
        ledger.append(entry(1)).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"source\":\"0202").unwrap();
        drop(file);

        let mut reopened = FileLedger::open(&path).unwrap();
        assert_eq!(reopened.last(), Some(entry(1)));
        reopened.append(entry(2)).unwrap();
        assert_eq!(FileLedger::open(&path).unwrap().len(), 2);
    }

    #[test]
    fn garbage_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        std::fs::write(&path, "not json\n").unwrap();
        match FileLedger::open(&path) {
            Err(LedgerError::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicates_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        FileLedger::rewrite(&path, &[entry(1), entry(2)]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let first = text.lines().next().unwrap();
        std::fs::write(&path, format!("{text}{first}\n")).unwrap();
        assert!(matches!(
            FileLedger::open(&path),
            Err(LedgerError::Corrupt { line: 3, .. })
        ));
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LEDGER_FILE_NAME);
        let mut ledger = FileLedger::open(&path).unwrap();
        ledger.append(entry(9)).unwrap();
        let rebuilt = FileLedger::rewrite(&path, &[entry(1), entry(2)]).unwrap();
        assert_eq!(rebuilt.entries(), &[entry(1), entry(2)]);
        assert!(!rebuilt.contains(oid(9)));
    }
}
