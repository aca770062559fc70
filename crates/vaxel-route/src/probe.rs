// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Background adapter health probe.
//!
//! Every tick each configured adapter gets a minimal non-streaming
//! completion per probe model under a deadline; optional smoke variants
//! also exercise the streaming and tool-call paths. Results flow into the
//! scheduler's health registry through the reconciliation channel like any
//! other health mutation. The probe never ticks while disabled.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};
use vaxel_events::{names, EventStore, NewEvent};
use vaxel_settings::{ProbeSettings, SettingsStore};
use vaxel_wire::{CanonicalRequest, Message, ToolSpec};

use crate::{health::HealthDelta, scheduler::Scheduler};

const DEFAULT_PROBE_MODEL: &str = "probe-default";

pub struct Probe {
    scheduler: Arc<Scheduler>,
    settings: Arc<SettingsStore>,
    events: Arc<EventStore>,
}

impl Probe {
    pub fn new(
        scheduler: Arc<Scheduler>,
        settings: Arc<SettingsStore>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            scheduler,
            settings,
            events,
        }
    }

    /// Tick until the shutdown signal flips. The interval is re-read from
    /// settings each round so admin changes apply without a restart.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let cfg = self.settings.get().probe;
            let interval = Duration::from_secs(cfg.interval_secs.max(1));
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("probe shutting down");
                        return;
                    }
                    continue;
                }
            }
            let cfg = self.settings.get().probe;
            if !cfg.enabled {
                continue;
            }
            self.tick(&cfg).await;
        }
    }

    /// Probe every adapter once, in parallel.
    pub async fn tick(&self, cfg: &ProbeSettings) {
        let adapters = self.scheduler.adapter_names();
        let runs = adapters.iter().map(|name| self.probe_adapter(name, cfg));
        futures::future::join_all(runs).await;
    }

    async fn probe_adapter(&self, name: &str, cfg: &ProbeSettings) {
        let Some(adapter) = self.scheduler.get(name) else {
            return;
        };
        let deadline = Duration::from_secs(cfg.timeout_secs.max(1));
        let models: Vec<String> = if cfg.models.is_empty() {
            vec![DEFAULT_PROBE_MODEL.to_string()]
        } else {
            cfg.models.clone()
        };

        let mut ok = true;
        let mut detail = String::new();
        'models: for model in &models {
            let req = probe_request(false);
            match tokio::time::timeout(deadline, adapter.complete(&req, model)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    ok = false;
                    detail = format!("completion failed: {e}");
                    break 'models;
                }
                Err(_) => {
                    ok = false;
                    detail = format!("completion timed out after {deadline:?}");
                    break 'models;
                }
            }
            if cfg.stream_smoke {
                let req = probe_request(true);
                let streamed = tokio::time::timeout(deadline, async {
                    let mut stream = adapter.stream(&req, model).await?;
                    // One event proves the stream opens and produces data.
                    stream.next().await.transpose()
                })
                .await;
                match streamed {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        ok = false;
                        detail = format!("stream smoke failed: {e}");
                        break 'models;
                    }
                    Err(_) => {
                        ok = false;
                        detail = "stream smoke timed out".into();
                        break 'models;
                    }
                }
            }
            if cfg.tool_smoke {
                let mut req = probe_request(false);
                req.tools = vec![ToolSpec {
                    name: "probe_echo".into(),
                    description: "echo probe".into(),
                    input_schema: json!({"type": "object"}),
                }];
                match tokio::time::timeout(deadline, adapter.complete(&req, model)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        ok = false;
                        detail = format!("tool smoke failed: {e}");
                        break 'models;
                    }
                    Err(_) => {
                        ok = false;
                        detail = "tool smoke timed out".into();
                        break 'models;
                    }
                }
            }
        }

        if !ok {
            warn!(adapter = %name, %detail, "probe failed");
        }
        self.scheduler.registry().report(HealthDelta::ProbeResult {
            adapter: name.to_string(),
            ok,
        });
        self.events.append(
            NewEvent::new(names::PROBE_RESULT)
                .with_data(json!({ "adapter": name, "ok": ok, "detail": detail })),
        );
    }
}

fn probe_request(stream: bool) -> CanonicalRequest {
    CanonicalRequest {
        model: DEFAULT_PROBE_MODEL.into(),
        messages: vec![Message::user("ping")],
        system: None,
        tools: vec![],
        max_tokens: 1,
        stream,
        metadata: Default::default(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
