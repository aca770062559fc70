// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The admin control surface.
//!
//! Everything here is protected by the admin token (accepted as
//! `Authorization: Bearer` or `x-admin-token`, compared in constant time)
//! and, unlike the public dialects, rejects unknown top-level body fields
//! with a `request.unsupported_fields` event carrying a redacted `curl`
//! reproduction.

use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::info;
use vaxel_events::{names, NewEvent};
use vaxel_loop::catalog::ToolEntry;
use vaxel_quota::RateGate;
use vaxel_route::{adapter::ADAPTER_KINDS, Channel, ChannelStatus};
use vaxel_settings::{ProbeSettings, RuntimeSettings, UpstreamSettings};
use vaxel_wire::GatewayError;

use crate::{
    error::{redacted_curl, ApiError},
    state::RuntimeContext,
};

// ─── Auth ─────────────────────────────────────────────────────────────────────

fn admin_candidate(headers: &HeaderMap) -> Option<&str> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token);
        }
    }
    headers.get("x-admin-token").and_then(|v| v.to_str().ok())
}

/// Gate for every admin and observability handler.
pub(crate) fn require_admin(
    state: &Arc<RuntimeContext>,
    headers: &HeaderMap,
) -> Result<(), Response> {
    let Some(expected) = &state.admin_token else {
        return Err(ApiError(GatewayError::Auth(
            "admin surface disabled (no admin token configured)".into(),
        ))
        .into_response());
    };
    match admin_candidate(headers) {
        Some(candidate) if expected.verify(candidate) => Ok(()),
        Some(_) => Err(ApiError(GatewayError::Auth("bad admin token".into())).into_response()),
        None => Err(ApiError(GatewayError::Auth("missing admin token".into())).into_response()),
    }
}

// ─── Strict decoding ──────────────────────────────────────────────────────────

/// Decode an admin body, rejecting unknown top-level fields. The rejection
/// is recorded as `request.unsupported_fields` with a redacted curl line.
fn strict_top_level<T: DeserializeOwned>(
    state: &Arc<RuntimeContext>,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    allowed: &[&str],
) -> Result<T, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        decode_reject(
            state,
            path,
            headers,
            body,
            names::REQUEST_DECODE_FAILED,
            GatewayError::InvalidRequest(format!("invalid JSON body: {e}")),
        )
    })?;
    if let Some(obj) = value.as_object() {
        let unknown: Vec<&String> =
            obj.keys().filter(|k| !allowed.contains(&k.as_str())).collect();
        if !unknown.is_empty() {
            let err = GatewayError::InvalidRequest(format!(
                "unknown fields: {}",
                unknown
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            return Err(decode_reject(
                state,
                path,
                headers,
                body,
                names::REQUEST_UNSUPPORTED_FIELDS,
                err,
            ));
        }
    }
    serde_json::from_value(value).map_err(|e| {
        decode_reject(
            state,
            path,
            headers,
            body,
            names::REQUEST_DECODE_FAILED,
            GatewayError::InvalidRequest(format!("invalid body: {e}")),
        )
    })
}

fn decode_reject(
    state: &Arc<RuntimeContext>,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    event_type: &str,
    err: GatewayError,
) -> Response {
    state.events.append(NewEvent::new(event_type).with_data(json!({
        "path": path,
        "error": err.to_string(),
        "curl_command": redacted_curl("PUT", path, headers, body),
    })));
    state.metrics.record_error(err.kind());
    ApiError(err).into_response()
}

/// Re-derive everything that depends on a fresh settings value.
fn apply_settings(state: &Arc<RuntimeContext>, settings: RuntimeSettings) -> RuntimeSettings {
    let stored = state.settings.put(settings);
    if let Err(e) = state.scheduler.rebuild_from_settings(&stored) {
        tracing::warn!(error = %e, "adapter rebuild failed; keeping previous adapters");
    }
    state.replace_rate_gate(RateGate::new(stored.rate_limit.rps, stored.rate_limit.burst));
    state
        .events
        .append(NewEvent::new(names::SETTINGS_UPDATED).with_data(json!({})));
    stored
}

// ─── Settings ─────────────────────────────────────────────────────────────────

const SETTINGS_FIELDS: &[&str] = &[
    "routing",
    "tool_loop",
    "upstream",
    "probe",
    "rate_limit",
    "mode_models",
    "use_mode_model_override",
    "model_mappings",
    "model_map_fallback",
    "model_map_strict",
    "vision_support_hints",
    "tool_aliases",
    "allow_experimental_tools",
    "mcp_list_tools_ttl_secs",
];

pub async fn get_settings(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!(state.settings.get())).into_response()
}

pub async fn put_settings(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let settings: RuntimeSettings =
        match strict_top_level(&state, "/admin/settings", &headers, &body, SETTINGS_FIELDS) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
    let stored = apply_settings(&state, settings);
    info!("runtime settings replaced via admin API");
    Json(json!(stored)).into_response()
}

// ─── Tools ────────────────────────────────────────────────────────────────────

pub async fn get_tools(State(state): State<Arc<RuntimeContext>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({ "tools": state.catalog.list() })).into_response()
}

pub async fn put_tools(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    #[derive(serde::Deserialize)]
    struct ToolsBody {
        tools: Vec<ToolEntry>,
    }
    let parsed: ToolsBody =
        match strict_top_level(&state, "/admin/tools", &headers, &body, &["tools"]) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
    for existing in state.catalog.list() {
        state.catalog.remove(&existing.name);
    }
    for entry in parsed.tools {
        state.catalog.upsert(entry);
    }
    Json(json!({ "tools": state.catalog.list() })).into_response()
}

// ─── Model mapping ────────────────────────────────────────────────────────────

pub async fn get_model_mapping(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let s = state.settings.get();
    Json(json!({
        "mappings": s.model_mappings,
        "fallback": s.model_map_fallback,
        "strict": s.model_map_strict,
    }))
    .into_response()
}

pub async fn put_model_mapping(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    #[derive(serde::Deserialize)]
    struct MappingBody {
        #[serde(default)]
        mappings: HashMap<String, String>,
        #[serde(default)]
        fallback: Option<String>,
        #[serde(default)]
        strict: bool,
    }
    let parsed: MappingBody = match strict_top_level(
        &state,
        "/admin/model-mapping",
        &headers,
        &body,
        &["mappings", "fallback", "strict"],
    ) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut settings = state.settings.get();
    settings.model_mappings = parsed.mappings;
    settings.model_map_fallback = parsed.fallback;
    settings.model_map_strict = parsed.strict;
    let stored = apply_settings(&state, settings);
    Json(json!({
        "mappings": stored.model_mappings,
        "fallback": stored.model_map_fallback,
        "strict": stored.model_map_strict,
    }))
    .into_response()
}

// ─── Upstream / scheduler / probe ─────────────────────────────────────────────

pub async fn get_upstream(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let s = state.settings.get();
    let kinds: Vec<Value> = ADAPTER_KINDS
        .iter()
        .map(|m| {
            json!({
                "kind": m.kind,
                "name": m.name,
                "description": m.description,
                "default_api_key_env": m.default_api_key_env,
                "default_base_url": m.default_base_url,
            })
        })
        .collect();
    Json(json!({
        "upstream": s.upstream,
        "registered": state.scheduler.adapter_names(),
        "kinds": kinds,
    }))
    .into_response()
}

pub async fn put_upstream(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let upstream: UpstreamSettings = match strict_top_level(
        &state,
        "/admin/upstream",
        &headers,
        &body,
        &[
            "adapters",
            "model_routes",
            "default_route",
            "failure_threshold",
            "cooldown_secs",
            "strict_probe_gate",
        ],
    ) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut settings = state.settings.get();
    settings.upstream = upstream;
    let stored = apply_settings(&state, settings);
    Json(json!({ "upstream": stored.upstream })).into_response()
}

pub async fn get_scheduler(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let health: Vec<Value> = state
        .scheduler
        .registry()
        .snapshot()
        .into_iter()
        .map(|s| {
            json!({
                "adapter": s.adapter,
                "failure_count": s.failure_count,
                "cooldown_remaining_secs": s.cooldown_remaining_secs,
                "last_probe_ok": s.last_probe_ok,
            })
        })
        .collect();
    Json(json!({
        "adapters": state.scheduler.adapter_names(),
        "health": health,
    }))
    .into_response()
}

pub async fn get_probe(State(state): State<Arc<RuntimeContext>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!(state.settings.get().probe)).into_response()
}

pub async fn put_probe(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let probe: ProbeSettings = match strict_top_level(
        &state,
        "/admin/probe",
        &headers,
        &body,
        &[
            "enabled",
            "interval_secs",
            "timeout_secs",
            "stream_smoke",
            "tool_smoke",
            "models",
        ],
    ) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let mut settings = state.settings.get();
    settings.probe = probe;
    let stored = apply_settings(&state, settings);
    Json(json!(stored.probe)).into_response()
}

// ─── Channels ─────────────────────────────────────────────────────────────────

#[derive(serde::Deserialize)]
struct ChannelBody {
    group: String,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    status: ChannelStatus,
}

const CHANNEL_FIELDS: &[&str] = &["group", "models", "priority", "status"];

pub async fn list_channels(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({
        "channels": state.channels.list(),
        "ability_entries": state.channels.ability_len(),
    }))
    .into_response()
}

pub async fn create_channel(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let parsed: ChannelBody =
        match strict_top_level(&state, "/admin/channels", &headers, &body, CHANNEL_FIELDS) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
    let channel =
        state
            .channels
            .create(parsed.group, parsed.models, parsed.priority, parsed.status);
    state
        .events
        .append(NewEvent::new(names::CHANNELS_REBUILT).with_data(json!({"channel": channel.id})));
    Json(json!(channel)).into_response()
}

pub async fn update_channel(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let parsed: ChannelBody =
        match strict_top_level(&state, "/admin/channels", &headers, &body, CHANNEL_FIELDS) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
    let channel = Channel {
        id,
        group: parsed.group,
        models: parsed.models,
        priority: parsed.priority,
        status: parsed.status,
    };
    if !state.channels.update(channel.clone()) {
        return ApiError(GatewayError::NotFound(format!("no channel {id}"))).into_response();
    }
    state
        .events
        .append(NewEvent::new(names::CHANNELS_REBUILT).with_data(json!({"channel": id})));
    Json(json!(channel)).into_response()
}

pub async fn delete_channel(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    if !state.channels.delete(id) {
        return ApiError(GatewayError::NotFound(format!("no channel {id}"))).into_response();
    }
    Json(json!({ "deleted": id })).into_response()
}

// ─── Capabilities / status ────────────────────────────────────────────────────

pub async fn get_capabilities(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let adapters: Vec<Value> = state
        .scheduler
        .adapter_names()
        .into_iter()
        .filter_map(|name| {
            let adapter = state.scheduler.get(&name)?;
            let caps = adapter.capabilities();
            Some(json!({
                "adapter": name,
                "kind": adapter.kind(),
                "supports_tools": caps.supports_tools,
                "supports_vision": caps.supports_vision,
            }))
        })
        .collect();
    Json(json!({
        "adapters": adapters,
        "vision_support_hints": state.settings.get().vision_support_hints,
    }))
    .into_response()
}

pub async fn get_status(State(state): State<Arc<RuntimeContext>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let s = state.settings.get();
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "requests_total": state
            .metrics
            .requests_total
            .load(std::sync::atomic::Ordering::Relaxed),
        "errors_total": state
            .metrics
            .errors_total
            .load(std::sync::atomic::Ordering::Relaxed),
        "adapters": state.scheduler.adapter_names(),
        "probe_enabled": s.probe.enabled,
        "events": state.events.len(),
        "admin_ui_dist_dir": state.admin_ui_dist_dir,
    }))
    .into_response()
}

// ─── Bootstrap ────────────────────────────────────────────────────────────────

/// One-shot provisioning: settings, tool catalog, channels, and users with
/// fresh tokens, applied in that order.
pub async fn bootstrap_apply(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    #[derive(serde::Deserialize)]
    struct BootstrapUser {
        name: String,
        #[serde(default)]
        token_quotas: Vec<i64>,
    }
    #[derive(serde::Deserialize)]
    struct BootstrapBody {
        #[serde(default)]
        settings: Option<RuntimeSettings>,
        #[serde(default)]
        tools: Vec<ToolEntry>,
        #[serde(default)]
        channels: Vec<ChannelBody>,
        #[serde(default)]
        users: Vec<BootstrapUser>,
    }
    let parsed: BootstrapBody = match strict_top_level(
        &state,
        "/admin/bootstrap/apply",
        &headers,
        &body,
        &["settings", "tools", "channels", "users"],
    ) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Some(settings) = parsed.settings {
        apply_settings(&state, settings);
    }
    for entry in &parsed.tools {
        state.catalog.upsert(entry.clone());
    }
    for ch in &parsed.channels {
        state
            .channels
            .create(ch.group.clone(), ch.models.clone(), ch.priority, ch.status);
    }
    let mut minted: Vec<Value> = Vec::new();
    for user in &parsed.users {
        let created = state.tokens.create_user(&user.name);
        for quota in &user.token_quotas {
            if let Ok(token) = state.tokens.create_token(&created.id, *quota) {
                minted.push(json!({
                    "user_id": created.id,
                    "token": token.value,
                    "quota": quota,
                }));
            }
        }
    }
    info!(
        tools = parsed.tools.len(),
        channels = parsed.channels.len(),
        users = parsed.users.len(),
        "bootstrap applied"
    );
    Json(json!({
        "applied": true,
        "tools": parsed.tools.len(),
        "channels": parsed.channels.len(),
        "tokens": minted,
    }))
    .into_response()
}

// ─── Users & tokens ───────────────────────────────────────────────────────────

pub async fn list_users(State(state): State<Arc<RuntimeContext>>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({ "users": state.tokens.list_users() })).into_response()
}

pub async fn create_user(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    #[derive(serde::Deserialize)]
    struct UserBody {
        name: String,
    }
    let parsed: UserBody =
        match strict_top_level(&state, "/admin/auth/users", &headers, &body, &["name"]) {
            Ok(v) => v,
            Err(resp) => return resp,
        };
    Json(json!(state.tokens.create_user(parsed.name))).into_response()
}

pub async fn get_user(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.tokens.get_user(&id) {
        Some(user) => Json(json!(user)).into_response(),
        None => ApiError(GatewayError::NotFound(format!("no user {id:?}"))).into_response(),
    }
}

pub async fn delete_user(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    if state.tokens.delete_user(&id) {
        Json(json!({ "deleted": id })).into_response()
    } else {
        ApiError(GatewayError::NotFound(format!("no user {id:?}"))).into_response()
    }
}

pub async fn list_user_tokens(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    if state.tokens.get_user(&id).is_none() {
        return ApiError(GatewayError::NotFound(format!("no user {id:?}"))).into_response();
    }
    Json(json!({ "tokens": state.tokens.list_tokens(&id) })).into_response()
}

pub async fn create_user_token(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    #[derive(serde::Deserialize)]
    struct TokenBody {
        #[serde(default)]
        quota: i64,
    }
    let parsed: TokenBody = match strict_top_level(
        &state,
        "/admin/auth/users/tokens",
        &headers,
        &body,
        &["quota"],
    ) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.tokens.create_token(&id, parsed.quota) {
        Ok(token) => Json(json!(token)).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn delete_user_token(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    Path((_id, value)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    if state.tokens.delete_token(&value) {
        Json(json!({ "deleted": value })).into_response()
    } else {
        ApiError(GatewayError::NotFound("no such token".into())).into_response()
    }
}

// ─── Marketplace ──────────────────────────────────────────────────────────────

/// The marketplace catalogue is an external collaborator; the endpoint
/// exists so clients get a well-formed empty listing instead of a 404.
pub async fn marketplace_cloud_list(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({ "items": [] })).into_response()
}
