// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Liveness and Prometheus-style counters.

use std::sync::{atomic::Ordering, Arc};

use axum::{extract::State, response::IntoResponse};

use crate::state::RuntimeContext;

pub async fn healthz() -> impl IntoResponse {
    "ok"
}

pub async fn metrics(State(state): State<Arc<RuntimeContext>>) -> impl IntoResponse {
    let mut out = String::new();
    out.push_str("# TYPE vaxel_requests_total counter\n");
    out.push_str(&format!(
        "vaxel_requests_total {}\n",
        state.metrics.requests_total.load(Ordering::Relaxed)
    ));
    out.push_str("# TYPE vaxel_errors_total counter\n");
    out.push_str(&format!(
        "vaxel_errors_total {}\n",
        state.metrics.errors_total.load(Ordering::Relaxed)
    ));
    for (kind, count) in state.metrics.errors_by_kind() {
        out.push_str(&format!(
            "vaxel_errors_total{{kind=\"{kind}\"}} {count}\n"
        ));
    }
    out.push_str("# TYPE vaxel_adapter_failure_count gauge\n");
    out.push_str("# TYPE vaxel_adapter_cooldown_remaining_seconds gauge\n");
    out.push_str("# TYPE vaxel_adapter_probe_ok gauge\n");
    for snap in state.scheduler.registry().snapshot() {
        out.push_str(&format!(
            "vaxel_adapter_failure_count{{adapter=\"{}\"}} {}\n",
            snap.adapter, snap.failure_count
        ));
        out.push_str(&format!(
            "vaxel_adapter_cooldown_remaining_seconds{{adapter=\"{}\"}} {}\n",
            snap.adapter, snap.cooldown_remaining_secs
        ));
        out.push_str(&format!(
            "vaxel_adapter_probe_ok{{adapter=\"{}\"}} {}\n",
            snap.adapter,
            if snap.last_probe_ok { 1 } else { 0 }
        ));
    }
    out.push_str("# TYPE vaxel_events_total gauge\n");
    out.push_str(&format!("vaxel_events_total {}\n", state.events.len()));
    out
}
