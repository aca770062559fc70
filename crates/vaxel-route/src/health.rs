// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-adapter health: failure counters, cooldowns, and the probe gate.
//!
//! Health is the only mutable state read on the hot path by every request,
//! so it is sharded per adapter behind its own mutex. Mutations from the
//! hot path and from the probe both funnel through one reconciliation
//! channel; a single reconciler task applies them, so concurrent probes and
//! request completions never interleave their updates.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One health mutation, produced by the scheduler or the probe.
#[derive(Debug, Clone)]
pub enum HealthDelta {
    Success { adapter: String },
    TransientFailure { adapter: String },
    ProbeResult { adapter: String, ok: bool },
}

#[derive(Debug, Clone)]
struct HealthState {
    failure_count: u32,
    cooldown_until: Instant,
    last_probe_ok: bool,
}

impl HealthState {
    fn fresh() -> Self {
        Self {
            failure_count: 0,
            cooldown_until: Instant::now(),
            // Optimistic until the first probe reports; a strict gate must
            // not block all traffic at startup.
            last_probe_ok: true,
        }
    }
}

/// Read-only view for metrics and `/admin/scheduler`.
#[derive(Debug, Clone)]
pub struct AdapterHealthSnapshot {
    pub adapter: String,
    pub failure_count: u32,
    /// Seconds until the cooldown lifts; 0 when not cooling down.
    pub cooldown_remaining_secs: u64,
    pub last_probe_ok: bool,
}

pub struct HealthRegistry {
    states: RwLock<HashMap<String, Arc<Mutex<HealthState>>>>,
    failure_threshold: u32,
    cooldown: Duration,
    tx: mpsc::UnboundedSender<HealthDelta>,
}

impl HealthRegistry {
    /// Build the registry plus the receiving end of the reconciliation
    /// channel. The caller spawns [`HealthRegistry::run_reconciler`] with
    /// the receiver; until then (and in unit tests) deltas can be applied
    /// directly with [`HealthRegistry::apply`].
    pub fn new(
        failure_threshold: u32,
        cooldown: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HealthDelta>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                states: RwLock::new(HashMap::new()),
                failure_threshold: failure_threshold.max(1),
                cooldown,
                tx,
            }),
            rx,
        )
    }

    pub fn register(&self, adapter: &str) {
        self.states
            .write()
            .expect("health lock poisoned")
            .entry(adapter.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HealthState::fresh())));
    }

    fn state(&self, adapter: &str) -> Arc<Mutex<HealthState>> {
        if let Some(s) = self.states.read().expect("health lock poisoned").get(adapter) {
            return s.clone();
        }
        // Unknown adapters appear when settings are replaced at runtime.
        self.states
            .write()
            .expect("health lock poisoned")
            .entry(adapter.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HealthState::fresh())))
            .clone()
    }

    /// Enqueue a delta for the reconciler. Falls back to applying inline
    /// when the reconciler is gone (shutdown, tests without a runtime).
    pub fn report(&self, delta: HealthDelta) {
        if self.tx.send(delta.clone()).is_err() {
            self.apply(delta);
        }
    }

    /// Apply one delta. Called only by the reconciler task (or directly in
    /// tests), so per-adapter updates never interleave.
    pub fn apply(&self, delta: HealthDelta) {
        match delta {
            HealthDelta::Success { adapter } => {
                let state = self.state(&adapter);
                let mut s = state.lock().expect("health poisoned");
                s.failure_count = 0;
                s.cooldown_until = Instant::now();
            }
            HealthDelta::TransientFailure { adapter } => {
                let state = self.state(&adapter);
                let mut s = state.lock().expect("health poisoned");
                s.failure_count += 1;
                if s.failure_count >= self.failure_threshold {
                    s.cooldown_until = Instant::now() + self.cooldown;
                    warn!(
                        adapter = %adapter,
                        failures = s.failure_count,
                        cooldown_secs = self.cooldown.as_secs(),
                        "adapter tripped failure threshold, entering cooldown",
                    );
                }
            }
            HealthDelta::ProbeResult { adapter, ok } => {
                let state = self.state(&adapter);
                let mut s = state.lock().expect("health poisoned");
                s.last_probe_ok = ok;
                drop(s);
                if ok {
                    debug!(adapter = %adapter, "probe ok");
                } else {
                    // Probe failures count like transient request failures.
                    self.apply(HealthDelta::TransientFailure { adapter });
                }
            }
        }
    }

    /// Run the reconciler until the channel closes.
    pub async fn run_reconciler(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<HealthDelta>,
    ) {
        while let Some(delta) = rx.recv().await {
            self.apply(delta);
        }
    }

    /// Eligibility check. Expired cooldowns reset the failure counter as a
    /// side effect, so a tripped adapter re-enters rotation cleanly.
    pub fn eligible(&self, adapter: &str, strict_probe_gate: bool) -> bool {
        let state = self.state(adapter);
        let mut s = state.lock().expect("health poisoned");
        let now = Instant::now();
        if now < s.cooldown_until {
            return false;
        }
        if s.failure_count >= self.failure_threshold {
            // Cooldown expired: give the adapter a clean slate.
            s.failure_count = 0;
        }
        if strict_probe_gate && !s.last_probe_ok {
            return false;
        }
        true
    }

    pub fn snapshot(&self) -> Vec<AdapterHealthSnapshot> {
        let states = self.states.read().expect("health lock poisoned");
        let now = Instant::now();
        let mut out: Vec<AdapterHealthSnapshot> = states
            .iter()
            .map(|(name, state)| {
                let s = state.lock().expect("health poisoned");
                AdapterHealthSnapshot {
                    adapter: name.clone(),
                    failure_count: s.failure_count,
                    cooldown_remaining_secs: s
                        .cooldown_until
                        .saturating_duration_since(now)
                        .as_secs(),
                    last_probe_ok: s.last_probe_ok,
                }
            })
            .collect();
        out.sort_by(|a, b| a.adapter.cmp(&b.adapter));
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
