// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSONL write-ahead log of committed store transactions, with group commit.
//!
//! Each line is one transaction: `{"seq":N,"origin":"replica-..","events":[...]}`.
//! A transaction is either entirely on disk or absent; replay never sees half
//! of one. Appends are buffered and made durable by `flush()` (~10ms batches).

use ot_core::{Event, ReplicaId};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Flush interval for group commit
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum buffered transactions before forcing a flush
const FLUSH_THRESHOLD: usize = 100;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct WalRecordRef<'a> {
    seq: u64,
    origin: &'a ReplicaId,
    events: &'a [Event],
}

/// One committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub origin: ReplicaId,
    pub events: Vec<Event>,
}

/// A parsed line plus its raw text, so rewrites never re-serialize
struct RawEntry {
    entry: WalEntry,
    line: String,
}

/// Outcome of reading a WAL file front to back
struct Scan {
    entries: Vec<RawEntry>,
    /// Byte offset and parse error of the first bad line, if any
    corrupt_at: Option<(u64, String)>,
}

fn scan(file: &File) -> Result<Scan, WalError> {
    let mut reader = BufReader::new(file.try_clone()?);
    reader.seek(SeekFrom::Start(0))?;

    let mut entries = Vec::new();
    let mut offset = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let n = match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Ok(Scan {
                    entries,
                    corrupt_at: Some((offset, e.to_string())),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            match serde_json::from_str::<WalEntry>(trimmed) {
                Ok(entry) => entries.push(RawEntry {
                    entry,
                    line: trimmed.to_string(),
                }),
                Err(e) => {
                    return Ok(Scan {
                        entries,
                        corrupt_at: Some((offset, e.to_string())),
                    });
                }
            }
        }
        offset += n as u64;
    }
    Ok(Scan {
        entries,
        corrupt_at: None,
    })
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
}

/// Replace `path` with exactly `lines`, atomically.
fn rewrite(path: &Path, lines: &[&str]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Transaction log with buffered group commit.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Highest sequence number assigned
    write_seq: u64,
    /// Serialized records waiting for `flush()` (without trailing newline)
    write_buffer: Vec<Vec<u8>>,
    last_flush: Instant,
}

impl Wal {
    /// Open or create the WAL at `path`.
    ///
    /// A file with a corrupt tail is rotated to `.bak` and rewritten with the
    /// valid prefix so that a crash mid-write never blocks startup.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = open_append(path)?;
        let scanned = scan(&file)?;

        if let Some((offset, message)) = &scanned.corrupt_at {
            drop(file);
            let bak_path = crate::snapshot::rotate_bak_path(path);
            warn!(
                path = %path.display(),
                bak = %bak_path.display(),
                offset,
                error = %message,
                valid_entries = scanned.entries.len(),
                "corrupt WAL detected, rotating to .bak and keeping valid entries",
            );
            std::fs::rename(path, &bak_path)?;
            let lines: Vec<&str> = scanned.entries.iter().map(|e| e.line.as_str()).collect();
            rewrite(path, &lines)?;
            file = open_append(path)?;
        }

        let write_seq = scanned
            .entries
            .iter()
            .map(|e| e.entry.seq)
            .max()
            .unwrap_or(0);

        Ok(Self {
            file,
            path: path.to_owned(),
            write_seq,
            write_buffer: Vec::new(),
            last_flush: Instant::now(),
        })
    }

    /// Buffer one transaction. Not durable until `flush()`.
    pub fn append(&mut self, origin: &ReplicaId, events: &[Event]) -> Result<u64, WalError> {
        let seq = self.write_seq + 1;
        let bytes = serde_json::to_vec(&WalRecordRef {
            seq,
            origin,
            events,
        })?;
        self.write_seq = seq;
        self.write_buffer.push(bytes);
        Ok(seq)
    }

    /// Make sure the next assigned seq is greater than `seq`. Used after
    /// loading a snapshot newer than anything left in a truncated WAL.
    pub fn advance_to(&mut self, seq: u64) {
        self.write_seq = self.write_seq.max(seq);
    }

    pub fn needs_flush(&self) -> bool {
        !self.write_buffer.is_empty()
            && (self.last_flush.elapsed() >= FLUSH_INTERVAL
                || self.write_buffer.len() >= FLUSH_THRESHOLD)
    }

    /// Write all buffered transactions with a single fsync.
    pub fn flush(&mut self) -> Result<(), WalError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        for mut bytes in self.write_buffer.drain(..) {
            bytes.push(b'\n');
            self.file.write_all(&bytes)?;
        }
        self.file.sync_all()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    pub fn pending(&self) -> usize {
        self.write_buffer.len()
    }

    /// Drop transactions with `seq < keep_from`. Called after a durable
    /// snapshot covering them.
    pub fn truncate_before(&mut self, keep_from: u64) -> Result<(), WalError> {
        self.flush()?;
        let scanned = scan(&self.file)?;
        let kept: Vec<&str> = scanned
            .entries
            .iter()
            .filter(|e| e.entry.seq >= keep_from)
            .map(|e| e.line.as_str())
            .collect();
        rewrite(&self.path, &kept)?;
        self.file = open_append(&self.path)?;
        Ok(())
    }

    /// Flushed transactions with `seq > after`, for replay.
    pub fn entries_after(&self, after: u64) -> Result<Vec<WalEntry>, WalError> {
        let scanned = scan(&self.file)?;
        if let Some((offset, message)) = scanned.corrupt_at {
            warn!(offset, error = %message, "corrupt WAL entry during replay, stopping");
        }
        Ok(scanned
            .entries
            .into_iter()
            .map(|e| e.entry)
            .filter(|e| e.seq > after)
            .collect())
    }
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod tests;
