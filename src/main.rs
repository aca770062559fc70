// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use vaxel_events::EventStore;
use vaxel_loop::{McpRegistry, ToolCatalog};
use vaxel_quota::{RateGate, TokenService};
use vaxel_route::{ChannelStore, HealthRegistry, MockAdapter, Scheduler};
use vaxel_server::{
    backend::MemoryBackend,
    state::{AdminToken, Metrics, RunStore, RuntimeContext},
};
use vaxel_settings::SettingsStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(shell);
            Ok(())
        }
        Some(Commands::ShowSettings) => {
            let settings = vaxel_settings::env::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&settings)?);
            Ok(())
        }
        Some(Commands::Serve { bind, admin_token }) => {
            run_serve(cli.config.as_deref(), bind, admin_token).await
        }
        None => run_serve(cli.config.as_deref(), "127.0.0.1:8080".parse()?, None).await,
    }
}

async fn run_serve(
    config: Option<&std::path::Path>,
    bind: std::net::SocketAddr,
    admin_token: Option<String>,
) -> anyhow::Result<()> {
    let settings = vaxel_settings::env::load(config)?;
    let settings_store = Arc::new(SettingsStore::new(settings));
    let settings = settings_store.get();

    let (registry, health_rx) = HealthRegistry::new(
        settings.upstream.failure_threshold,
        Duration::from_secs(settings.upstream.cooldown_secs),
    );
    let scheduler = Arc::new(Scheduler::new(registry));
    scheduler.rebuild_from_settings(&settings)?;
    if scheduler.adapter_names().is_empty() {
        // A gateway with no upstreams is only useful for kicking the
        // tires; the echo adapter makes that obvious and harmless.
        warn!("no adapters configured; registering the built-in mock adapter");
        scheduler.register(Arc::new(MockAdapter::new("mock")));
    }

    let catalog = match std::env::var("TOOL_CATALOG_JSON") {
        Ok(raw) => Arc::new(ToolCatalog::from_json(&raw)?),
        Err(_) => Arc::new(ToolCatalog::new()),
    };

    let state = Arc::new(RuntimeContext {
        settings: settings_store,
        events: EventStore::shared(),
        scheduler,
        tokens: Arc::new(TokenService::new()),
        rate: std::sync::RwLock::new(Arc::new(RateGate::new(
            settings.rate_limit.rps,
            settings.rate_limit.burst,
        ))),
        catalog,
        mcp: Arc::new(McpRegistry::new()),
        channels: Arc::new(ChannelStore::new()),
        backend: Arc::new(MemoryBackend::new()),
        executor: None,
        admin_token: admin_token.as_deref().map(AdminToken::new),
        metrics: Metrics::default(),
        runs: RunStore::default(),
        started_at: std::time::Instant::now(),
        admin_ui_dist_dir: std::env::var("ADMIN_UI_DIST_DIR").ok(),
    });

    vaxel_server::serve(state, health_rx, bind).await
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
