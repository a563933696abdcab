//! Append-only operation log, the audit trail shown to the user.
//!
//! Records live in memory for the session and, when the log is opened on a
//! file, are also appended to it as JSON lines.

use crate::error::{ErrorReport, IoContext, PluginError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Install,
    Backup,
    Restore,
    Enable,
    Disable,
    Remove,
    DeleteBackup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub action: Action,
    pub target: String,
    pub outcome: Outcome,
    pub detail: String,
}

impl OperationRecord {
    pub fn success(action: Action, target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(action, target, Outcome::Success, detail)
    }

    pub fn failure(action: Action, target: impl Into<String>, error: &PluginError) -> Self {
        Self::new(
            action,
            target,
            Outcome::Failure,
            format!("{:?}: {}", error.kind(), error),
        )
    }

    fn new(action: Action, target: impl Into<String>, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            target: target.into(),
            outcome,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?} {} {:?}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.action,
            self.target,
            self.outcome,
            self.detail
        )
    }
}

#[derive(Debug, Default)]
pub struct OperationLog {
    records: Vec<OperationRecord>,
    journal: Option<PathBuf>,
    persist_error: Option<ErrorReport>,
}

impl OperationLog {
    /// A log that lives only for the current session.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a log backed by a JSON-lines journal, loading at most the last
    /// `history_limit` records from earlier sessions. Unreadable lines are
    /// skipped. A journal holding more than `history_limit` lines is
    /// rewritten with only the records kept.
    pub fn open(journal: impl AsRef<Path>, history_limit: usize) -> Result<Self> {
        let journal = journal.as_ref().to_path_buf();
        let mut records = Vec::new();
        let mut lines = 0;

        if journal.exists() {
            let file = fs::File::open(&journal).with_path("Failed to open operation journal", &journal)?;
            for (n, line) in BufReader::new(file).lines().enumerate() {
                let line = line.with_path("Failed to read operation journal", &journal)?;
                if line.trim().is_empty() {
                    continue;
                }
                lines += 1;
                match serde_json::from_str::<OperationRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping journal line {} in {:?}: {}", n + 1, journal, e),
                }
            }
        } else if let Some(parent) = journal.parent() {
            fs::create_dir_all(parent).with_path("Failed to create journal directory", parent)?;
        }

        if records.len() > history_limit {
            records.drain(..records.len() - history_limit);
        }
        if lines > history_limit {
            compact(&journal, &records)?;
            tracing::debug!(
                "Trimmed operation journal {:?} from {} to {} lines",
                journal,
                lines,
                records.len()
            );
        }

        Ok(Self {
            records,
            journal: Some(journal),
            persist_error: None,
        })
    }

    /// Appends a record. The record is always kept in memory; if writing it
    /// to the journal fails the error is returned, and logged once until the
    /// journal recovers.
    pub fn append(&mut self, record: OperationRecord) -> Result<()> {
        match record.outcome {
            Outcome::Success => tracing::info!(
                action = ?record.action,
                plugin = %record.target,
                "{}",
                record.detail
            ),
            Outcome::Failure => tracing::warn!(
                action = ?record.action,
                plugin = %record.target,
                "{}",
                record.detail
            ),
        }

        let persisted = match &self.journal {
            Some(path) => write_line(path, &record),
            None => Ok(()),
        };
        self.records.push(record);

        match persisted {
            Ok(()) => {
                self.persist_error = None;
                Ok(())
            }
            Err(e) => {
                if self.persist_error.is_none() {
                    tracing::error!("Operation journal is not being saved: {}", e);
                }
                self.persist_error = Some(e.to_report());
                Err(e)
            }
        }
    }

    /// The latest journal write failure, until a write succeeds again.
    pub fn persist_error(&self) -> Option<&ErrorReport> {
        self.persist_error.as_ref()
    }

    /// Records in insertion order, optionally filtered. The iterator is lazy
    /// and cloning it restarts from the same position.
    pub fn query<'a>(
        &'a self,
        action: Option<Action>,
        target: Option<&'a str>,
    ) -> impl Iterator<Item = &'a OperationRecord> + Clone + 'a {
        self.records.iter().filter(move |r| {
            action.map_or(true, |a| r.action == a) && target.map_or(true, |t| r.target == t)
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_deref()
    }
}

fn encode(record: &OperationRecord) -> Result<String> {
    let mut line = serde_json::to_string(record).map_err(|e| {
        PluginError::io(
            "Failed to serialize operation record",
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    line.push('\n');
    Ok(line)
}

/// Replaces the journal with `records`, through a temporary file in the same
/// directory.
fn compact(path: &Path, records: &[OperationRecord]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).with_path("Failed to create temporary journal in", dir)?;
    for record in records {
        tmp.write_all(encode(record)?.as_bytes())
            .with_path("Failed to write operation journal", tmp.path())?;
    }
    tmp.persist(path)
        .map_err(|e| PluginError::io(format!("Failed to replace operation journal {:?}", path), e.error))?;
    Ok(())
}

fn write_line(path: &Path, record: &OperationRecord) -> Result<()> {
    let line = encode(record)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_path("Failed to open operation journal", path)?;
    file.write_all(line.as_bytes())
        .with_path("Failed to write operation journal", path)
}
