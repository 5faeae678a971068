//! Session persistence: one JSONL file per session under the history dir.
//!
//! Line 1 is a header record; every following line is one `ChatMessage` in
//! conversation order.  Files are written whole through a temp file and a
//! rename, so a crash mid-save never leaves a half-written session behind.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use coda_llm::ChatMessage;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone)]
pub struct SavedSession {
    pub header: SessionHeader,
    pub messages: Vec<ChatMessage>,
}

/// `YYYYMMDD-HHMMSS-xxxxxxxx`: sortable, and unique enough per machine.
pub fn new_session_id() -> String {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &suffix[..8])
}

pub fn session_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{session_id}.jsonl"))
}

/// Write the full transcript, replacing any earlier save of the same session.
pub fn save_session(dir: &Path, session_id: &str, messages: &[ChatMessage]) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create history dir {}", dir.display()))?;
    let path = session_path(dir, session_id);
    let tmp = path.with_extension("jsonl.tmp");

    let header = SessionHeader {
        session_id: session_id.to_string(),
        saved_at: Utc::now(),
        message_count: messages.len(),
    };
    {
        let file = fs::File::create(&tmp)
            .with_context(|| format!("create temp session file {}", tmp.display()))?;
        let mut out = BufWriter::new(file);
        serde_json::to_writer(&mut out, &header).context("serialize session header")?;
        out.write_all(b"\n")?;
        for msg in messages {
            serde_json::to_writer(&mut out, msg).context("serialize message")?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    fs::rename(&tmp, &path)
        .with_context(|| format!("move {} -> {}", tmp.display(), path.display()))?;
    Ok(path)
}

pub fn load_session(path: &Path) -> Result<SavedSession> {
    let file = fs::File::open(path)
        .with_context(|| format!("open session file {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let header: SessionHeader = match lines.next() {
        Some(line) => serde_json::from_str(line?.trim())
            .with_context(|| format!("bad session header in {}", path.display()))?,
        None => bail!("{} is empty", path.display()),
    };

    let mut messages = Vec::with_capacity(header.message_count);
    for (i, line) in lines.enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let msg: ChatMessage = serde_json::from_str(trimmed)
            .with_context(|| format!("{}: bad message on line {}", path.display(), i + 2))?;
        messages.push(msg);
    }
    if messages.len() != header.message_count {
        tracing::warn!(
            path = %path.display(),
            expected = header.message_count,
            found = messages.len(),
            "session message count differs from header"
        );
    }
    Ok(SavedSession { header, messages })
}

/// Saved sessions, newest first.  Unreadable files are skipped.
pub fn list_sessions(dir: &Path) -> Result<Vec<(PathBuf, SessionHeader)>> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(file) = fs::File::open(&path) else {
            continue;
        };
        let Some(Ok(first)) = BufReader::new(file).lines().next() else {
            continue;
        };
        if let Ok(header) = serde_json::from_str::<SessionHeader>(first.trim()) {
            found.push((path, header));
        }
    }
    found.sort_by(|a, b| b.1.saved_at.cmp(&a.1.saved_at));
    Ok(found)
}
