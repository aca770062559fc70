// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The runtime context threaded through every handler.
//!
//! All process-wide stores live here as explicit fields — no hidden
//! singletons. Handlers receive an `Arc<RuntimeContext>` as axum state.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};

use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use vaxel_events::EventStore;
use vaxel_loop::{McpRegistry, ToolCatalog, ToolExecutor};
use vaxel_quota::{RateGate, TokenService};
use vaxel_route::{ChannelStore, Scheduler};
use vaxel_settings::SettingsStore;

use crate::backend::Backend;

/// Admin bearer token, stored as a SHA-256 hash and compared in constant
/// time. `None` disables the admin surface entirely.
pub struct AdminToken {
    hash: [u8; 32],
}

impl AdminToken {
    pub fn new(raw: &str) -> Self {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Sha256::digest(raw.as_bytes()));
        Self { hash }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let candidate: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        self.hash.ct_eq(&candidate).into()
    }
}

/// Request/error counters for `/metrics`.
#[derive(Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    errors_by_kind: Mutex<BTreeMap<&'static str, u64>>,
}

impl Metrics {
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &'static str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        *self
            .errors_by_kind
            .lock()
            .expect("metrics lock poisoned")
            .entry(kind)
            .or_insert(0) += 1;
    }

    pub fn errors_by_kind(&self) -> Vec<(&'static str, u64)> {
        self.errors_by_kind
            .lock()
            .expect("metrics lock poisoned")
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}

/// One finished (or cancelled) run, for `/v1/cc/runs`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub mode: String,
    pub client_model: String,
    pub upstream_model: String,
    /// `ok`, `error`, or `cancelled`.
    pub status: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub duration_ms: u64,
    pub created_at: String,
}

#[derive(Default)]
pub struct RunStore {
    runs: RwLock<Vec<RunSummary>>,
}

impl RunStore {
    pub fn record(&self, run: RunSummary) {
        self.runs.write().expect("run lock poisoned").push(run);
    }

    pub fn list(&self, limit: usize) -> Vec<RunSummary> {
        let runs = self.runs.read().expect("run lock poisoned");
        let start = runs.len().saturating_sub(limit);
        runs[start..].to_vec()
    }
}

pub struct RuntimeContext {
    pub settings: Arc<SettingsStore>,
    pub events: Arc<EventStore>,
    pub scheduler: Arc<Scheduler>,
    pub tokens: Arc<TokenService>,
    /// Swapped when an admin changes the rate-limit settings.
    pub rate: RwLock<Arc<RateGate>>,
    pub catalog: Arc<ToolCatalog>,
    pub mcp: Arc<McpRegistry>,
    pub channels: Arc<ChannelStore>,
    pub backend: Arc<dyn Backend>,
    pub executor: Option<Arc<dyn ToolExecutor>>,
    pub admin_token: Option<AdminToken>,
    pub metrics: Metrics,
    pub runs: RunStore,
    pub started_at: Instant,
    /// From `ADMIN_UI_DIST_DIR`; the dashboard itself is served by an
    /// external collaborator, the path is only reported in `/admin/status`.
    pub admin_ui_dist_dir: Option<String>,
}

impl RuntimeContext {
    pub fn rate_gate(&self) -> Arc<RateGate> {
        self.rate.read().expect("rate lock poisoned").clone()
    }

    pub fn replace_rate_gate(&self, gate: RateGate) {
        *self.rate.write().expect("rate lock poisoned") = Arc::new(gate);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
