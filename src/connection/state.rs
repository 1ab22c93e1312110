//! Per-device connection state machine.
//!
//! Transitions are validated; an invalid transition is a programming error
//! surfaced as [`PoolError::InvalidStateTransition`], not a runtime
//! condition. A bounded history of (state, timestamp) pairs is retained per
//! device for diagnostics.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pool::PoolError;

/// Connection state of one device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    Error,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "DISCONNECTED",
            LinkState::Connecting => "CONNECTING",
            LinkState::Connected => "CONNECTED",
            LinkState::Disconnecting => "DISCONNECTING",
            LinkState::Reconnecting => "RECONNECTING",
            LinkState::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

impl LinkState {
    /// Whether `self -> next` is a legal edge.
    pub fn can_transition(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Disconnecting)
                | (Connected, Reconnecting)
                | (Connected, Error)
                | (Disconnecting, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Error)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }

    /// States that occupy a slot under the connection cap.
    pub fn occupies_slot(self) -> bool {
        matches!(
            self,
            LinkState::Connecting
                | LinkState::Connected
                | LinkState::Reconnecting
                | LinkState::Disconnecting
        )
    }
}

/// Retained history depth per device.
pub const HISTORY_LIMIT: usize = 32;

#[derive(Debug)]
struct StateEntry {
    current: LinkState,
    history: VecDeque<(LinkState, DateTime<Utc>)>,
}

impl StateEntry {
    fn new() -> Self {
        let mut history = VecDeque::with_capacity(HISTORY_LIMIT);
        history.push_back((LinkState::Disconnected, Utc::now()));
        Self {
            current: LinkState::Disconnected,
            history,
        }
    }
}

/// State and history for every device the pool has seen. Not synchronized;
/// the pool guards it with its single lock.
#[derive(Debug, Default)]
pub struct StateMachine {
    entries: HashMap<String, StateEntry>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; `DISCONNECTED` for devices never seen.
    pub fn current(&self, address: &str) -> LinkState {
        self.entries
            .get(address)
            .map(|e| e.current)
            .unwrap_or(LinkState::Disconnected)
    }

    /// Recent transition history, oldest first.
    pub fn history(&self, address: &str) -> Vec<(LinkState, DateTime<Utc>)> {
        self.entries
            .get(address)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply a validated transition. Returns the previous state.
    pub fn transition(
        &mut self,
        address: &str,
        next: LinkState,
        reason: &str,
    ) -> Result<LinkState, PoolError> {
        let entry = self
            .entries
            .entry(address.to_string())
            .or_insert_with(StateEntry::new);

        let current = entry.current;
        if current == next {
            return Ok(current);
        }
        if !current.can_transition(next) {
            return Err(PoolError::InvalidStateTransition {
                address: address.to_string(),
                from: current,
                to: next,
            });
        }

        debug!("{address}: {current} -> {next} ({reason})");
        entry.current = next;
        if entry.history.len() >= HISTORY_LIMIT {
            entry.history.pop_front();
        }
        entry.history.push_back((next, Utc::now()));
        Ok(current)
    }

    pub fn remove(&mut self, address: &str) {
        self.entries.remove(address);
    }

    /// Number of devices in slot-occupying states.
    pub fn occupied(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.current.occupies_slot())
            .count()
    }

    pub fn connected(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.current == LinkState::Connected)
            .count()
    }
}
