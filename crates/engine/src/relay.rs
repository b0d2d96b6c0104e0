// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cross-replica delivery: republishes store changes made by other replicas
//! on the local bus.

use crate::context::Ctx;
use ot_core::{ChangeKind, Clock, ClusterEvent, LogKey, Payload, Table};
use ot_storage::{Change, MaterializedState};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Relay<C: Clock> {
    ctx: Ctx<C>,
    feed: broadcast::Receiver<Change>,
}

impl<C: Clock> Relay<C> {
    /// Subscribes to the change feed immediately so nothing committed after
    /// construction is missed.
    pub fn new(ctx: Ctx<C>) -> Self {
        let feed = ctx.store.subscribe();
        Self { ctx, feed }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let change = tokio::select! {
                _ = cancel.cancelled() => break,
                change = self.feed.recv() => change,
            };
            match change {
                Ok(change) => self.forward(change),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "relay lagged behind the change feed");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(replica = %self.ctx.replica, "relay stopped");
    }

    fn forward(&self, change: Change) {
        if change.origin == self.ctx.replica || change.table == Table::Lease {
            return;
        }
        let payload = if change.kind == ChangeKind::Deleted {
            None
        } else {
            match self.ctx.store.read(|state| fetch(state, &change)) {
                Some(payload) => Some(payload),
                // Deleted since; a later delete change will follow
                None => return,
            }
        };
        self.ctx.bus.publish(ClusterEvent {
            kind: change.kind,
            table: change.table,
            id: change.id,
            payload,
            origin: change.origin,
        });
    }
}

/// Current row for a change, or the appended span for a log change.
pub(crate) fn fetch(state: &MaterializedState, change: &Change) -> Option<Payload> {
    let id = change.id.as_str();
    match change.table {
        Table::Run => state.get_run(id).map(|r| Payload::Run(Box::new(r.clone()))),
        Table::Job => state.get_job(id).map(|j| Payload::Job(Box::new(j.clone()))),
        Table::Workspace => state.get_workspace(id).cloned().map(Payload::Workspace),
        Table::ConfigVersion => state
            .get_config_version(id)
            .cloned()
            .map(Payload::ConfigVersion),
        Table::Runner => state.get_runner(id).cloned().map(Payload::Runner),
        Table::Log => {
            let (start, end) = change.span?;
            let key = LogKey::parse(id)?;
            let chunk = state.log(&key)?.read(&key, start, end.saturating_sub(start));
            (!chunk.is_empty()).then_some(Payload::Chunk(chunk))
        }
        Table::Lease => None,
    }
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
