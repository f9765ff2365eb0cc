//! Append-only audit record stores.
//!
//! Records persist as newline-delimited JSON; re-opening a chain over an
//! existing store resumes the sequence from the last record.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::AuditRecord;

/// Backing storage for an audit chain.
pub trait AuditStore: Send + Sync {
    /// Append one record. Must be durable before returning.
    fn append(&mut self, record: &AuditRecord) -> Result<()>;

    /// Load every record in append order.
    fn load_all(&self) -> Result<Vec<AuditRecord>>;
}

/// In-memory store, for tests and ephemeral chains.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Vec<AuditRecord>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&mut self, record: &AuditRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditRecord>> {
        Ok(self.records.clone())
    }
}

/// Newline-delimited JSON file store.
#[derive(Debug)]
pub struct FileAuditStore {
    path: PathBuf,
}

impl FileAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for FileAuditStore {
    fn append(&mut self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize audit record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to audit log {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync audit log {}", self.path.display()))?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read audit log {}", self.path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line).with_context(|| {
                format!(
                    "malformed audit record at line {} of {}",
                    lineno + 1,
                    self.path.display()
                )
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
