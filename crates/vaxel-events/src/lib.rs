// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Append-only lifecycle event store.
//!
//! Every stage of the request pipeline appends [`Event`]s here; consumers
//! (the observability read API, live SSE subscribers, audit) read by filter.
//! Within one process event ids are strictly monotonically increasing, so a
//! consumer that remembers the last id it saw can resume without gaps.
//!
//! The store is append-only: events are never mutated or deleted while the
//! process lives. Readers iterate a snapshot slice taken under a short read
//! lock, so a slow consumer never blocks producers.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub mod names;

/// One lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonically increasing within the process.
    pub id: u64,
    /// Dotted event name, e.g. `run.completed`. See [`names`].
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_id: Option<String>,
    /// Free-form payload. Producers keep this small; large upstream bodies
    /// are summarised before they get here.
    #[serde(default)]
    pub data: Value,
    /// RFC 3339 timestamp assigned at append time.
    pub created_at: String,
}

/// A new event before the store assigns its id and timestamp.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub event_type: String,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
    pub team_id: Option<String>,
    pub subagent_id: Option<String>,
    pub data: Value,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn run(event_type: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            run_id: Some(run_id.into()),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_subagent(mut self, subagent_id: impl Into<String>) -> Self {
        self.subagent_id = Some(subagent_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Filter applied by readers. All set fields must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
    pub team_id: Option<String>,
    pub subagent_id: Option<String>,
    /// Only events with `id > after_id` are returned.
    pub after_id: Option<u64>,
    /// Cap on the number of returned events (applied after filtering).
    pub limit: Option<usize>,
}

impl EventFilter {
    fn matches(&self, ev: &Event) -> bool {
        if let Some(t) = &self.event_type {
            if &ev.event_type != t {
                return false;
            }
        }
        if let Some(s) = &self.session_id {
            if ev.session_id.as_deref() != Some(s) {
                return false;
            }
        }
        if let Some(r) = &self.run_id {
            if ev.run_id.as_deref() != Some(r) {
                return false;
            }
        }
        if let Some(t) = &self.team_id {
            if ev.team_id.as_deref() != Some(t) {
                return false;
            }
        }
        if let Some(s) = &self.subagent_id {
            if ev.subagent_id.as_deref() != Some(s) {
                return false;
            }
        }
        if let Some(after) = self.after_id {
            if ev.id <= after {
                return false;
            }
        }
        true
    }
}

/// Capacity of the live broadcast channel. A lagging subscriber misses live
/// events but can always re-read the log via [`EventStore::list`].
const BROADCAST_CAPACITY: usize = 256;

/// Process-wide append-only event log with filtered reads and a live
/// broadcast feed for SSE subscribers.
#[derive(Debug)]
pub struct EventStore {
    next_id: AtomicU64,
    log: RwLock<Vec<Event>>,
    live: broadcast::Sender<Event>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            log: RwLock::new(Vec::new()),
            live,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Append one event and return it with its assigned id.
    ///
    /// Single-writer semantics: id assignment and the push happen under one
    /// write lock, so ids in the log are strictly increasing.
    pub fn append(&self, ev: NewEvent) -> Event {
        let mut log = self.log.write().expect("event log lock poisoned");
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            event_type: ev.event_type,
            session_id: ev.session_id,
            run_id: ev.run_id,
            team_id: ev.team_id,
            subagent_id: ev.subagent_id,
            data: ev.data,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        log.push(event.clone());
        drop(log);
        // Nobody listening is fine; the log is the source of truth.
        let _ = self.live.send(event.clone());
        event
    }

    /// Read events matching `filter`, oldest first.
    pub fn list(&self, filter: &EventFilter) -> Vec<Event> {
        let log = self.log.read().expect("event log lock poisoned");
        let iter = log.iter().filter(|e| filter.matches(e)).cloned();
        match filter.limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Number of events appended so far.
    pub fn len(&self) -> usize {
        self.log.read().expect("event log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to the live feed. Events appended after this call are
    /// delivered in append order; use [`EventStore::list`] to catch up on
    /// history first.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live.subscribe()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
