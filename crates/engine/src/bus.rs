// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local fan-out of cluster events.
//!
//! Publishing never blocks. Each subscriber has a bounded buffer; when it
//! falls behind, the oldest events are dropped and the subscriber logs how
//! many it missed.

use ot_core::{ClusterEvent, RunId, Table, WorkspaceId};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ClusterEvent) {
        tracing::trace!(event = %event.log_summary(), "publish");
        // Nobody listening is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.sender.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Which events a subscriber wants. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    tables: Vec<Table>,
    workspace_id: Option<WorkspaceId>,
    run_id: Option<RunId>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    pub fn workspace(mut self, id: WorkspaceId) -> Self {
        self.workspace_id = Some(id);
        self
    }

    pub fn run(mut self, id: RunId) -> Self {
        self.run_id = Some(id);
        self
    }

    /// Deletes have no payload, so subject criteria fall back to the event
    /// id for rows of the subject's own table.
    pub fn matches(&self, event: &ClusterEvent) -> bool {
        if !self.tables.is_empty() && !self.tables.contains(&event.table) {
            return false;
        }
        if let Some(ws) = &self.workspace_id {
            let hit = match event.workspace_id() {
                Some(id) => id == ws,
                None => event.table == Table::Workspace && event.id == ws.as_str(),
            };
            if !hit {
                return false;
            }
        }
        if let Some(run) = &self.run_id {
            let hit = match event.run_id() {
                Some(id) => id == run,
                None => event.table == Table::Run && event.id == run.as_str(),
            };
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Filtered receiver half of the bus
pub struct Subscription {
    rx: broadcast::Receiver<ClusterEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ClusterEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(dropped)) => {
                    tracing::warn!(dropped, "event subscriber lagged, oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Events buffered and not yet received, matching or not
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
