// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared fixtures for unit and integration tests.

use std::{sync::Arc, time::Duration};

use vaxel_events::EventStore;
use vaxel_loop::{McpRegistry, ToolCatalog};
use vaxel_quota::{RateGate, TokenService};
use vaxel_route::{ChannelStore, HealthRegistry, MockAdapter, Scheduler};
use vaxel_settings::{CapabilityHints, RuntimeSettings, SettingsStore};

use crate::{
    backend::MemoryBackend,
    state::{AdminToken, Metrics, RunStore, RuntimeContext},
};

fn base_state(scheduler: Arc<Scheduler>, admin_token: Option<&str>) -> Arc<RuntimeContext> {
    Arc::new(RuntimeContext {
        settings: Arc::new(SettingsStore::new(RuntimeSettings::default())),
        events: EventStore::shared(),
        scheduler,
        tokens: Arc::new(TokenService::new()),
        rate: std::sync::RwLock::new(Arc::new(RateGate::new(10_000, 10_000))),
        catalog: Arc::new(ToolCatalog::new()),
        mcp: Arc::new(McpRegistry::new()),
        channels: Arc::new(ChannelStore::new()),
        backend: Arc::new(MemoryBackend::new()),
        executor: None,
        admin_token: admin_token.map(AdminToken::new),
        metrics: Metrics::default(),
        runs: RunStore::default(),
        started_at: std::time::Instant::now(),
        admin_ui_dist_dir: None,
    })
}

/// State with one healthy mock adapter and no auth configured.
pub fn test_state() -> Arc<RuntimeContext> {
    let (registry, _) = HealthRegistry::new(3, Duration::from_secs(60));
    let scheduler = Arc::new(Scheduler::new(registry));
    scheduler.register(Arc::new(MockAdapter::new("mock")));
    base_state(scheduler, None)
}

/// State whose only adapter advertises `supports_tools = false`.
pub fn test_state_with_toolless_adapter() -> Arc<RuntimeContext> {
    let (registry, _) = HealthRegistry::new(3, Duration::from_secs(60));
    let scheduler = Arc::new(Scheduler::new(registry));
    scheduler.register(Arc::new(MockAdapter::new("toolless").with_capabilities(
        CapabilityHints {
            supports_tools: Some(false),
            supports_vision: None,
        },
    )));
    base_state(scheduler, None)
}

/// State with an admin token, for admin/observability endpoint tests.
pub fn test_state_with_admin(token: &str) -> Arc<RuntimeContext> {
    let (registry, _) = HealthRegistry::new(3, Duration::from_secs(60));
    let scheduler = Arc::new(Scheduler::new(registry));
    scheduler.register(Arc::new(MockAdapter::new("mock")));
    base_state(scheduler, Some(token))
}
