//! Append-only record of every tool authorization decision.
//!
//! Entries are written once and never mutated.  The in-memory copy is always
//! kept; a JSONL file sink is optional and failures writing to it are logged
//! rather than propagated, so auditing never blocks the agent.

pub mod events;

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

pub use crate::events::{AuditDecision, AuditEntry};

/// String arguments longer than this are shortened in the record.
const MAX_RECORDED_ARG_CHARS: usize = 512;

/// Build an entry stamped with the current time.
pub fn entry(
    call_id: impl Into<String>,
    tool_name: impl Into<String>,
    arguments: &Value,
    decision: AuditDecision,
    error_code: Option<&str>,
    reason: Option<String>,
) -> AuditEntry {
    AuditEntry {
        timestamp: Utc::now(),
        call_id: call_id.into(),
        tool_name: tool_name.into(),
        arguments: shorten(arguments),
        decision,
        error_code: error_code.map(str::to_string),
        reason,
    }
}

fn shorten(v: &Value) -> Value {
    match v {
        Value::String(s) if s.chars().count() > MAX_RECORDED_ARG_CHARS => {
            let head: String = s.chars().take(MAX_RECORDED_ARG_CHARS).collect();
            Value::String(format!("{head}...[{} chars]", s.chars().count()))
        }
        Value::Array(items) => Value::Array(items.iter().map(shorten).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), shorten(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    sink: Option<Mutex<File>>,
}

impl AuditLog {
    /// In-memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// In-memory plus a JSONL file opened in append mode.
    pub fn with_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self {
            entries: Mutex::new(Vec::new()),
            sink: Some(Mutex::new(file)),
        })
    }

    /// Append one entry.  Safe to call from concurrent tasks.
    pub fn append(&self, entry: AuditEntry) {
        if let Some(sink) = &self.sink {
            let line = match serde_json::to_string(&entry) {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "audit entry not serializable");
                    String::new()
                }
            };
            if !line.is_empty() {
                match sink.lock() {
                    Ok(mut f) => {
                        if let Err(e) = writeln!(f, "{line}").and_then(|_| f.flush()) {
                            warn!(error = %e, "failed to write audit entry");
                        }
                    }
                    Err(_) => warn!("audit sink lock poisoned"),
                }
            }
        }
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    /// Snapshot of everything recorded so far, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(e) => e.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read the last `limit` entries from a JSONL audit file.  Lines that do not
/// parse are skipped.
pub fn read_tail(path: impl AsRef<Path>, limit: usize) -> Result<Vec<AuditEntry>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut all: Vec<AuditEntry> = BufReader::new(file)
        .lines()
        .map_while(|l| l.ok())
        .filter_map(|l| serde_json::from_str(&l).ok())
        .collect();
    let skip = all.len().saturating_sub(limit);
    Ok(all.split_off(skip))
}
