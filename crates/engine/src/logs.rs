// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log relay: append, read, and live tail of phase logs.
//!
//! Appends are announced on the bus like every other mutation, so a tail on
//! any replica sees chunks written on any other. A tail trusts the bus only
//! for liveness: gaps (lagged subscriber, relay delay) are filled from the
//! store before anything newer is delivered.

use crate::bus::{EventFilter, Subscription};
use crate::context::Ctx;
use crate::error::EngineError;
use crate::jobs::check_append;
use ot_core::{Chunk, Clock, ClusterEvent, Event, LogKey, Phase, RunId, Table};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

const TAIL_BUFFER: usize = 64;

#[derive(Clone)]
pub struct LogService<C: Clock> {
    ctx: Ctx<C>,
}

impl<C: Clock> LogService<C> {
    pub fn new(ctx: Ctx<C>) -> Self {
        Self { ctx }
    }

    /// Append a chunk. Its offset must equal the stored length and it must
    /// not be empty.
    pub fn put_chunk(&self, chunk: Chunk) -> Result<(), EngineError> {
        self.ctx.commit(|state| {
            check_append(state, &chunk)?;
            Ok((vec![Event::ChunkAppended { chunk }], ()))
        })
    }

    /// Bytes `[offset, offset + limit)` of a phase log; `limit == 0` reads
    /// to the end.
    pub fn get_chunk(
        &self,
        run_id: &RunId,
        phase: Phase,
        offset: u64,
        limit: u64,
    ) -> Result<Chunk, EngineError> {
        let key = LogKey::new(run_id.clone(), phase);
        self.ctx.store.read(|state| {
            if state.get_run(run_id.as_str()).is_none() {
                return Err(EngineError::not_found(Table::Run, run_id));
            }
            Ok(match state.log(&key) {
                Some(log) => log.read(&key, offset, limit),
                None => Chunk::new(run_id.clone(), phase, 0, Vec::new()),
            })
        })
    }

    /// Follow a phase log from `offset`: stored bytes first, then live
    /// chunks. Ends after the end marker or once the run is finished.
    pub fn tail(&self, run_id: &RunId, phase: Phase, offset: u64) -> Result<Tail, EngineError> {
        // Subscribe before the first read so nothing falls between them
        let events = self
            .ctx
            .bus
            .subscribe(EventFilter::all().run(run_id.clone()));
        if self
            .ctx
            .store
            .read(|state| state.get_run(run_id.as_str()).is_none())
        {
            return Err(EngineError::not_found(Table::Run, run_id));
        }

        let (tx, rx) = mpsc::channel(TAIL_BUFFER);
        let cancel = CancellationToken::new();
        let follower = Follower {
            ctx: self.ctx.clone(),
            key: LogKey::new(run_id.clone(), phase),
            delivered: offset,
            tx,
            events,
        };
        tokio::spawn(follower.run(cancel.clone()));
        Ok(Tail {
            rx,
            _guard: cancel.drop_guard(),
        })
    }
}

/// A live, ordered stream of chunks. Dropping it stops the tail.
pub struct Tail {
    rx: mpsc::Receiver<Chunk>,
    _guard: DropGuard,
}

impl Tail {
    /// The next chunk, or `None` once the log is complete.
    pub async fn next(&mut self) -> Option<Chunk> {
        self.rx.recv().await
    }
}

struct Follower<C: Clock> {
    ctx: Ctx<C>,
    key: LogKey,
    delivered: u64,
    tx: mpsc::Sender<Chunk>,
    events: Subscription,
}

enum Wake {
    CatchUp,
    Stop,
}

impl<C: Clock> Follower<C> {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let (stored, finished) = self.ctx.store.read(|state| {
                let stored = state
                    .log(&self.key)
                    .map(|log| log.read(&self.key, self.delivered, 0));
                let complete = state.log(&self.key).is_some_and(|log| log.is_complete());
                let run_done = state
                    .get_run(self.key.run_id.as_str())
                    .is_none_or(|run| run.is_done());
                (stored, complete || run_done)
            });
            if let Some(chunk) = stored.filter(|c| !c.is_empty()) {
                if !self.deliver(chunk).await {
                    return;
                }
            }
            if finished {
                break;
            }

            match self.wait(&cancel).await {
                Wake::CatchUp => continue,
                Wake::Stop => return,
            }
        }
        debug!(log = %self.key, delivered = self.delivered, "tail complete");
    }

    /// Deliver live chunks until something calls for a store read.
    async fn wait(&mut self, cancel: &CancellationToken) -> Wake {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Wake::Stop,
                _ = self.tx.closed() => return Wake::Stop,
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                return Wake::Stop;
            };
            match self.classify(&event) {
                Live::Skip => continue,
                Live::Fresh(chunk) => {
                    let end = chunk.is_end();
                    if !self.deliver(chunk).await {
                        return Wake::Stop;
                    }
                    if end {
                        return Wake::CatchUp;
                    }
                }
                Live::Gap | Live::RunChanged => return Wake::CatchUp,
            }
        }
    }

    fn classify(&self, event: &ClusterEvent) -> Live {
        match event.table {
            Table::Log => {
                let Some(chunk) = event.chunk() else {
                    return Live::Gap;
                };
                if chunk.log_key() != self.key {
                    return Live::Skip;
                }
                match chunk.cut(self.delivered) {
                    None => Live::Skip,
                    Some(rest) if rest.offset == self.delivered => Live::Fresh(rest),
                    Some(_) => Live::Gap,
                }
            }
            Table::Run => {
                let finished = event.run().is_none_or(|run| run.is_done());
                if finished {
                    Live::RunChanged
                } else {
                    Live::Skip
                }
            }
            _ => Live::Skip,
        }
    }

    async fn deliver(&mut self, chunk: Chunk) -> bool {
        self.delivered = chunk.end();
        self.tx.send(chunk).await.is_ok()
    }
}

enum Live {
    Skip,
    Fresh(Chunk),
    Gap,
    RunChanged,
}

#[cfg(test)]
#[path = "logs_tests.rs"]
mod tests;
