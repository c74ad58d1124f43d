//! Bounded recent-command history kept by the coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::models::{Command, CommandKind, CommandResponse, CommandStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub alert_id: String,
    pub correlation_id: String,
    pub cluster_context: String,
    pub kind: CommandKind,
    pub priority: i32,
    pub routed_at: DateTime<Utc>,
    pub status: Option<CommandStatus>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn routed(command: &Command) -> Self {
        Self {
            alert_id: command.alert_id.clone(),
            correlation_id: command.correlation_id.clone(),
            cluster_context: command.cluster_context.clone(),
            kind: command.kind,
            priority: command.priority,
            routed_at: Utc::now(),
            status: None,
            completed_at: None,
        }
    }
}

/// Ring buffer of routed commands. Oldest entries fall off past `capacity`.
#[derive(Debug, Clone)]
pub(crate) struct HistoryRing {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Mark the newest matching entry with the command's terminal status.
    pub fn record_completion(&mut self, response: &CommandResponse) -> bool {
        match self.entries.iter_mut().rev().find(|e| {
            e.alert_id == response.alert_id && e.cluster_context == response.cluster_context
        }) {
            Some(entry) => {
                entry.status = Some(response.status);
                entry.completed_at = Some(response.completed_at);
                true
            }
            None => false,
        }
    }

    /// Keep only the newest `keep` entries; returns how many were dropped.
    pub fn compact(&mut self, keep: usize) -> usize {
        let dropped = self.entries.len().saturating_sub(keep);
        self.entries.drain(..dropped);
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}
