//! Tamper-evident audit chain.
//!
//! Each record links to its predecessor by hash:
//! `hash = SHA-256(sequence : previous_hash : canonical(payload))`, with
//! the genesis link being 64 zero hex characters. Verification walks the
//! chain from sequence 1, recomputing every hash and checking every link;
//! the first mismatch is reported by sequence number. Appends serialize
//! under a single writer lock.

pub mod canonical;
pub mod store;

use std::fmt::Write as _;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use canonical::canonical_json;
pub use store::{AuditStore, FileAuditStore, MemoryAuditStore};

/// The previous-hash value of the first record.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One hash-linked audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonic from 1, contiguous.
    pub sequence: u64,
    /// Event kind label (not covered by the hash; see module docs).
    pub kind: String,
    pub payload: Value,
    pub previous_hash: String,
    pub hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of a chain verification walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Sequence number of the first offending record, when invalid.
    pub first_break_at: Option<u64>,
    pub message: String,
}

/// Audit export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Cef,
}

/// Compute the record hash over `sequence : previous_hash : canonical(payload)`.
fn record_hash(sequence: u64, previous_hash: &str, payload: &Value) -> String {
    let material = format!("{sequence}:{previous_hash}:{}", canonical_json(payload));
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)
}

struct ChainInner {
    store: Box<dyn AuditStore>,
    next_sequence: u64,
    tail_hash: String,
}

/// Hash-linked, append-only audit chain.
pub struct AuditChain {
    inner: Mutex<ChainInner>,
}

impl AuditChain {
    /// Open a chain over a store, resuming the sequence and tail hash
    /// from the last persisted record.
    pub fn open(store: Box<dyn AuditStore>) -> Result<Self> {
        let records = store.load_all()?;
        let (next_sequence, tail_hash) = match records.last() {
            Some(last) => (last.sequence + 1, last.hash.clone()),
            None => (1, GENESIS_HASH.to_owned()),
        };
        Ok(Self {
            inner: Mutex::new(ChainInner {
                store,
                next_sequence,
                tail_hash,
            }),
        })
    }

    /// Open an ephemeral in-memory chain.
    pub fn in_memory() -> Self {
        Self::open(Box::new(MemoryAuditStore::new()))
            .expect("in-memory audit store cannot fail to open")
    }

    /// Append an event to the chain.
    pub fn log_event(&self, kind: &str, payload: Value) -> Result<AuditRecord> {
        let mut inner = self.inner.lock().expect("audit chain lock poisoned");

        let sequence = inner.next_sequence;
        let previous_hash = inner.tail_hash.clone();
        let hash = record_hash(sequence, &previous_hash, &payload);

        let record = AuditRecord {
            sequence,
            kind: kind.to_owned(),
            payload,
            previous_hash,
            hash: hash.clone(),
            recorded_at: Utc::now(),
        };

        inner.store.append(&record)?;
        inner.next_sequence = sequence + 1;
        inner.tail_hash = hash;

        Ok(record)
    }

    /// Walk the chain from sequence 1, recomputing every hash and
    /// checking every previous-hash link.
    pub fn verify_chain(&self) -> Result<ChainVerification> {
        let inner = self.inner.lock().expect("audit chain lock poisoned");
        let records = inner.store.load_all()?;
        Ok(verify_records(&records))
    }

    /// Export the full chain in the requested format.
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        let inner = self.inner.lock().expect("audit chain lock poisoned");
        let records = inner.store.load_all()?;
        match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(&records).context("failed to export audit chain")
            }
            ExportFormat::Cef => Ok(records.iter().map(cef_line).collect::<Vec<_>>().join("\n")),
        }
    }

    /// All records in append order.
    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        let inner = self.inner.lock().expect("audit chain lock poisoned");
        inner.store.load_all()
    }
}

/// Verify an explicit record slice (used for re-imported exports too).
pub fn verify_records(records: &[AuditRecord]) -> ChainVerification {
    let mut previous_hash = GENESIS_HASH;

    for (i, record) in records.iter().enumerate() {
        let expected_sequence = i as u64 + 1;
        if record.sequence != expected_sequence {
            return broken(
                expected_sequence,
                format!(
                    "sequence gap: expected {expected_sequence}, found {}",
                    record.sequence
                ),
            );
        }
        if record.previous_hash != previous_hash {
            return broken(
                record.sequence,
                format!("previous-hash link broken at sequence {}", record.sequence),
            );
        }
        let recomputed = record_hash(record.sequence, &record.previous_hash, &record.payload);
        if recomputed != record.hash {
            return broken(
                record.sequence,
                format!("hash mismatch at sequence {}", record.sequence),
            );
        }
        previous_hash = &record.hash;
    }

    ChainVerification {
        valid: true,
        first_break_at: None,
        message: format!("chain of {} record(s) verified", records.len()),
    }
}

/// Parse a JSON export back into records (round-trip for archives).
pub fn import_json(json: &str) -> Result<Vec<AuditRecord>> {
    serde_json::from_str(json).context("failed to import audit chain export")
}

fn broken(sequence: u64, message: String) -> ChainVerification {
    ChainVerification {
        valid: false,
        first_break_at: Some(sequence),
        message,
    }
}

// ---------------------------------------------------------------------------
// CEF export
// ---------------------------------------------------------------------------

const CEF_VENDOR: &str = "Warden";
const CEF_PRODUCT: &str = "warden-core";
const CEF_SEVERITY: &str = "5";

/// Render one record as a CEF line with flattened payload fields.
fn cef_line(record: &AuditRecord) -> String {
    let mut line = format!(
        "CEF:0|{}|{}|{}|{}|{}|{}|",
        CEF_VENDOR,
        CEF_PRODUCT,
        env!("CARGO_PKG_VERSION"),
        cef_escape_prefix(&record.kind),
        cef_escape_prefix(&record.kind),
        CEF_SEVERITY,
    );

    let _ = write!(
        line,
        "seq={} hash={} prevHash={} rt={}",
        record.sequence,
        record.hash,
        record.previous_hash,
        record.recorded_at.to_rfc3339(),
    );

    let mut fields = Vec::new();
    flatten_payload("", &record.payload, &mut fields);
    for (key, value) in fields {
        let _ = write!(line, " {}={}", key, cef_escape_extension(&value));
    }

    line
}

/// Flatten a payload into dotted key/value pairs, keys sorted.
fn flatten_payload(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_payload(&path, &map[key], out);
            }
        }
        Value::Array(_) => {
            let key = if prefix.is_empty() { "payload" } else { prefix };
            out.push((key.to_owned(), value.to_string()));
        }
        Value::String(s) => {
            let key = if prefix.is_empty() { "payload" } else { prefix };
            out.push((key.to_owned(), s.clone()));
        }
        other => {
            let key = if prefix.is_empty() { "payload" } else { prefix };
            out.push((key.to_owned(), other.to_string()));
        }
    }
}

/// Escape a CEF header field (backslash and pipe).
fn cef_escape_prefix(s: &str) -> String {
    s.replace('\\', "\\\\").replace('|', "\\|")
}

/// Escape a CEF extension value (backslash, equals, newlines).
fn cef_escape_extension(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}
