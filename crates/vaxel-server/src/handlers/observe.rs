// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `/v1/cc/*` observability read surface.
//!
//! Read-only views over the event store, the run log, the KV-backed CRUD
//! stores, and the registered MCP servers. Everything here requires the
//! admin token.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use vaxel_events::EventFilter;

use crate::{
    handlers::admin::require_admin,
    state::RuntimeContext,
};

pub async fn list_events(
    State(state): State<Arc<RuntimeContext>>,
    headers: axum::http::HeaderMap,
    Query(filter): Query<EventFilter>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({ "events": state.events.list(&filter) })).into_response()
}

#[derive(Deserialize)]
pub struct RunsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

pub async fn list_runs(
    State(state): State<Arc<RuntimeContext>>,
    headers: axum::http::HeaderMap,
    Query(q): Query<RunsQuery>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({ "runs": state.runs.list(q.limit) })).into_response()
}

/// One handler covers every KV-backed collection; the prefix is fixed by
/// the route table, never by the caller.
async fn list_collection(state: &Arc<RuntimeContext>, prefix: &str, field: &str) -> Response {
    let items = crate::backend::list_json(state.backend.as_ref(), prefix);
    Json(json!({ field: items })).into_response()
}

macro_rules! collection_handler {
    ($name:ident, $prefix:expr, $field:expr) => {
        pub async fn $name(
            State(state): State<Arc<RuntimeContext>>,
            headers: axum::http::HeaderMap,
        ) -> Response {
            if let Err(resp) = require_admin(&state, &headers) {
                return resp;
            }
            list_collection(&state, $prefix, $field).await
        }
    };
}

collection_handler!(list_sessions, "session/", "sessions");
collection_handler!(list_todos, "todo/", "todos");
collection_handler!(list_plans, "plan/", "plans");
collection_handler!(list_plugins, "plugin/", "plugins");
collection_handler!(list_skills, "skill/", "skills");
collection_handler!(list_teams, "team/", "teams");
collection_handler!(list_subagents, "subagent/", "subagents");

pub async fn list_mcp_servers(
    State(state): State<Arc<RuntimeContext>>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let mut servers = Vec::new();
    for server in state.mcp.servers() {
        servers.push(json!({
            "name": server.name(),
            "healthy": server.health().await,
        }));
    }
    Json(json!({ "servers": servers })).into_response()
}

/// Live SSE feed of one subagent's events: history first, then the
/// broadcast feed filtered to the same subagent id.
pub async fn stream_subagent_events(
    State(state): State<Arc<RuntimeContext>>,
    headers: axum::http::HeaderMap,
    Path(subagent_id): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let history = state.events.list(&EventFilter {
        subagent_id: Some(subagent_id.clone()),
        ..Default::default()
    });
    let rx = state.events.subscribe();
    let backlog = futures::stream::iter(
        history
            .into_iter()
            .map(|ev| Ok::<_, std::convert::Infallible>(event_frame(&ev))),
    );
    let live = futures::StreamExt::filter_map(BroadcastStream::new(rx), move |item| {
        let id = subagent_id.clone();
        async move {
            match item {
                Ok(ev) if ev.subagent_id.as_deref() == Some(id.as_str()) => {
                    Some(Ok::<_, std::convert::Infallible>(event_frame(&ev)))
                }
                _ => None,
            }
        }
    });
    let body = Body::from_stream(futures::StreamExt::chain(backlog, live));
    Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("sse response build")
}

fn event_frame(ev: &vaxel_events::Event) -> Vec<u8> {
    format!(
        "data: {}\n\n",
        serde_json::to_string(ev).unwrap_or_else(|_| "{}".into())
    )
    .into_bytes()
}
