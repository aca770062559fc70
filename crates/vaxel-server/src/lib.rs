// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP surface of the vaxel gateway.
//!
//! [`router`] wires the public dialect endpoints, the admin control
//! surface, and the observability read API onto one axum router;
//! [`serve`] adds the background tasks (health reconciler, probe) and
//! blocks until ctrl-c/SIGTERM.

pub mod backend;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod state;
pub mod test_support;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::sync::{mpsc, watch};
use tower_http::{
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
};
use tracing::info;
use vaxel_route::{probe::Probe, HealthDelta};

use crate::handlers::{admin, chat, messages, metrics, observe, responses_api};
use crate::state::RuntimeContext;

/// Request bodies above this are rejected before decoding.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn router(state: Arc<RuntimeContext>) -> Router {
    Router::new()
        // ── Public dialects ───────────────────────────────────────────────────
        .route("/v1/messages", post(messages::post_messages))
        .route("/v1/messages/count_tokens", post(messages::count_tokens))
        .route("/v1/chat/completions", post(chat::post_chat_completions))
        .route("/v1/responses", post(responses_api::post_responses))
        // ── Liveness & metrics ────────────────────────────────────────────────
        .route("/healthz", get(metrics::healthz))
        .route("/metrics", get(metrics::metrics))
        // ── Admin ─────────────────────────────────────────────────────────────
        .route(
            "/admin/settings",
            get(admin::get_settings).put(admin::put_settings),
        )
        .route("/admin/tools", get(admin::get_tools).put(admin::put_tools))
        .route(
            "/admin/model-mapping",
            get(admin::get_model_mapping).put(admin::put_model_mapping),
        )
        .route(
            "/admin/upstream",
            get(admin::get_upstream).put(admin::put_upstream),
        )
        .route("/admin/scheduler", get(admin::get_scheduler))
        .route("/admin/probe", get(admin::get_probe).put(admin::put_probe))
        .route(
            "/admin/channels",
            get(admin::list_channels).post(admin::create_channel),
        )
        .route(
            "/admin/channels/:id",
            put(admin::update_channel).delete(admin::delete_channel),
        )
        .route("/admin/capabilities", get(admin::get_capabilities))
        .route("/admin/status", get(admin::get_status))
        .route("/admin/bootstrap/apply", post(admin::bootstrap_apply))
        .route(
            "/admin/auth/users",
            get(admin::list_users).post(admin::create_user),
        )
        .route(
            "/admin/auth/users/:id",
            get(admin::get_user).delete(admin::delete_user),
        )
        .route(
            "/admin/auth/users/:id/tokens",
            get(admin::list_user_tokens).post(admin::create_user_token),
        )
        .route(
            "/admin/auth/users/:id/tokens/:value",
            axum::routing::delete(admin::delete_user_token),
        )
        .route(
            "/admin/marketplace/cloud/list",
            get(admin::marketplace_cloud_list),
        )
        // ── Observability read API ────────────────────────────────────────────
        .route("/v1/cc/events", get(observe::list_events))
        .route("/v1/cc/runs", get(observe::list_runs))
        .route("/v1/cc/sessions", get(observe::list_sessions))
        .route("/v1/cc/todos", get(observe::list_todos))
        .route("/v1/cc/plans", get(observe::list_plans))
        .route("/v1/cc/plugins", get(observe::list_plugins))
        .route("/v1/cc/skills", get(observe::list_skills))
        .route("/v1/cc/teams", get(observe::list_teams))
        .route("/v1/cc/mcp/servers", get(observe::list_mcp_servers))
        .route("/v1/cc/subagents", get(observe::list_subagents))
        .route(
            "/v1/cc/subagents/:id/stream",
            get(observe::stream_subagent_events),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the gateway: reconciler + probe in the background, axum in the
/// foreground until ctrl-c/SIGTERM.
pub async fn serve(
    state: Arc<RuntimeContext>,
    health_rx: mpsc::UnboundedReceiver<HealthDelta>,
    bind: SocketAddr,
) -> anyhow::Result<()> {
    tokio::spawn(state.scheduler.registry().clone().run_reconciler(health_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe = Probe::new(
        state.scheduler.clone(),
        state.settings.clone(),
        state.events.clone(),
    );
    tokio::spawn(probe.run(shutdown_rx));

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(
        %bind,
        adapters = ?state.scheduler.adapter_names(),
        probe_enabled = state.settings.get().probe.enabled,
        admin = state.admin_token.is_some(),
        "vaxel gateway listening",
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await?;
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
