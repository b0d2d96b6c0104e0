// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log chunks and the per-phase append-only log.
//!
//! The first chunk of a phase log starts with [`START_MARKER`] and the last
//! ends with [`END_MARKER`]. Offsets are byte offsets into the phase log and
//! every append must land exactly at the current length.

use crate::run::{Phase, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// STX: first byte of a phase log
pub const START_MARKER: u8 = 0x02;
/// ETX: last byte of a complete phase log
pub const END_MARKER: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk is empty")]
    Empty,
    #[error("chunk offset {got} does not match log length {expected}")]
    OffsetMismatch { expected: u64, got: u64 },
    #[error("log already complete")]
    Complete,
}

/// A contiguous slice of a phase log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub run_id: RunId,
    pub phase: Phase,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(run_id: RunId, phase: Phase, offset: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            run_id,
            phase,
            offset,
            data: data.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn is_start(&self) -> bool {
        self.offset == 0 && self.data.first() == Some(&START_MARKER)
    }

    pub fn is_end(&self) -> bool {
        self.data.last() == Some(&END_MARKER)
    }

    /// Drop bytes before `from`. `None` when nothing remains.
    pub fn cut(&self, from: u64) -> Option<Chunk> {
        if from >= self.end() {
            return None;
        }
        let skip = from.saturating_sub(self.offset) as usize;
        Some(Chunk {
            run_id: self.run_id.clone(),
            phase: self.phase,
            offset: self.offset.max(from),
            data: self.data[skip..].to_vec(),
        })
    }

    /// Payload with markers removed, for display.
    pub fn text(&self) -> String {
        let mut bytes = self.data.as_slice();
        if self.offset == 0 {
            bytes = bytes.strip_prefix(&[START_MARKER]).unwrap_or(bytes);
        }
        bytes = bytes.strip_suffix(&[END_MARKER]).unwrap_or(bytes);
        String::from_utf8_lossy(bytes).into_owned()
    }

    /// Key of the phase log this chunk belongs to.
    pub fn log_key(&self) -> LogKey {
        LogKey::new(self.run_id.clone(), self.phase)
    }
}

/// Identifies one phase log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogKey {
    pub run_id: RunId,
    pub phase: Phase,
}

impl LogKey {
    pub fn new(run_id: RunId, phase: Phase) -> Self {
        Self { run_id, phase }
    }

    /// Inverse of `Display`: `run-1/plan`
    pub fn parse(s: &str) -> Option<Self> {
        let (run, phase) = s.rsplit_once('/')?;
        let phase = match phase {
            "plan" => Phase::Plan,
            "apply" => Phase::Apply,
            _ => return None,
        };
        Some(Self::new(RunId::new(run), phase))
    }
}

impl std::fmt::Display for LogKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run_id, self.phase)
    }
}

/// Append-only bytes of one phase log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLog {
    pub data: Vec<u8>,
}

impl PhaseLog {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.data.last() == Some(&END_MARKER)
    }

    /// Validate that `chunk` may be appended without mutating.
    pub fn check(&self, chunk: &Chunk) -> Result<(), ChunkError> {
        if chunk.is_empty() {
            return Err(ChunkError::Empty);
        }
        if self.is_complete() {
            return Err(ChunkError::Complete);
        }
        if chunk.offset != self.len() {
            return Err(ChunkError::OffsetMismatch {
                expected: self.len(),
                got: chunk.offset,
            });
        }
        Ok(())
    }

    pub fn append(&mut self, chunk: &Chunk) -> Result<(), ChunkError> {
        self.check(chunk)?;
        self.data.extend_from_slice(&chunk.data);
        Ok(())
    }

    /// Bytes in `[offset, offset + limit)`; `limit == 0` reads to the end.
    pub fn read(&self, key: &LogKey, offset: u64, limit: u64) -> Chunk {
        let len = self.len();
        let start = offset.min(len);
        let end = if limit == 0 {
            len
        } else {
            start.saturating_add(limit).min(len)
        };
        Chunk {
            run_id: key.run_id.clone(),
            phase: key.phase,
            offset: start,
            data: self.data[start as usize..end as usize].to_vec(),
        }
    }
}

#[cfg(test)]
#[path = "chunk_tests.rs"]
mod tests;
