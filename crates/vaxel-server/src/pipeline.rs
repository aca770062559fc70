// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The canonical request pipeline.
//!
//! Every public dialect handler funnels through the same fixed stage
//! sequence: authorize → rate-limit → resolve mode/model → capability
//! fallback → pre-reserve quota → route → (tool loop | single shot) →
//! settle quota → emit events. The dialect handlers only decode and
//! encode; everything between is shared here.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::Arc,
    time::Instant,
};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue},
    response::Response,
};
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, warn};
use vaxel_events::{names, NewEvent};
use vaxel_loop::{ToolLoop, ToolLoopOptions};
use vaxel_quota::{ReserveOutcome, TokenService};
use vaxel_route::{scheduler::select_route, AdapterError};
use vaxel_settings::{
    glob_match, resolve_model, AdapterKind, CapabilityHints, EmulationMode, RuntimeSettings,
    ToolLoopMode,
};
use vaxel_wire::{
    anthropic, canonical::new_run_id, openai, responses, CanonicalRequest, CanonicalResponse,
    ContentBlock, GatewayError, MessageContent, StreamEvent,
};

use crate::state::{RunSummary, RuntimeContext};

/// Which public dialect the request arrived in; drives stream encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    OpenAiChat,
    OpenAiResponses,
}

// ─── Quota reservation guard ──────────────────────────────────────────────────

/// Holds a pre-reserved amount; cancelled on drop unless committed. A
/// dropped request future (client disconnect) therefore always returns its
/// reservation.
#[derive(Debug)]
struct Reservation {
    tokens: Arc<TokenService>,
    value: String,
    amount: i64,
    run_id: String,
    settled: bool,
}

impl Reservation {
    fn commit(&mut self, actual: i64) {
        if !self.settled {
            self.tokens
                .commit(&self.value, self.amount, actual, &self.run_id);
            self.settled = true;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.tokens.cancel(&self.value, self.amount, &self.run_id);
        }
    }
}

// ─── Request context ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RequestContext {
    pub run_id: String,
    pub session_id: Option<String>,
    pub mode: String,
    pub client_model: String,
    pub upstream_model: String,
    pub route: Vec<String>,
    pub settings: RuntimeSettings,
    pub effective_loop: ToolLoopMode,
    pub emulation: EmulationMode,
    pub started_at: Instant,
    reservation: Option<Reservation>,
    events: Arc<vaxel_events::EventStore>,
    /// Set once the run has settled (ok or error). A context dropped
    /// without settling was cancelled — typically a client disconnect —
    /// and records `run.completed` with `status=cancelled`.
    completed: bool,
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if !self.completed {
            self.events.append(
                NewEvent::run(names::RUN_COMPLETED, &self.run_id).with_data(json!({
                    "status": "cancelled",
                })),
            );
        }
    }
}

impl RequestContext {
    /// Headers attached to every response.
    pub fn response_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-cc-requested-model", self.client_model.clone()),
            ("x-cc-upstream-model", self.upstream_model.clone()),
            ("x-cc-run-id", self.run_id.clone()),
            ("x-cc-mode", self.mode.clone()),
            ("x-cc-client-model", self.client_model.clone()),
        ]
    }

    fn retries(&self, req: &CanonicalRequest) -> u32 {
        req.metadata
            .routing_retries
            .unwrap_or(self.settings.routing.retries)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = header_str(headers, "authorization") {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    header_str(headers, "x-api-key").map(str::to_string)
}

// ─── Capability resolution ────────────────────────────────────────────────────

/// Tri-state capability view for the effective route: adapter hints, then
/// settings vision hints, then the explicit metadata override — last one
/// wins.
fn resolve_capabilities(
    state: &RuntimeContext,
    settings: &RuntimeSettings,
    req: &CanonicalRequest,
    upstream_model: &str,
    route: &[String],
) -> CapabilityHints {
    let mut caps = route
        .iter()
        .find_map(|name| state.scheduler.get(name))
        .map(|a| a.capabilities())
        .unwrap_or_default();
    let mut best: Option<(&String, &bool)> = None;
    for (pattern, allowed) in &settings.vision_support_hints {
        if pattern == upstream_model || glob_match(pattern, upstream_model) {
            let specificity = pattern.chars().filter(|c| *c != '*').count();
            let current = best.map(|(p, _)| p.chars().filter(|c| *c != '*').count());
            if current.map_or(true, |c| specificity > c) {
                best = Some((pattern, allowed));
            }
        }
    }
    if let Some((_, allowed)) = best {
        caps.supports_vision = Some(*allowed);
    }
    if let Some(v) = req.metadata.upstream_supports_vision {
        caps.supports_vision = Some(v);
    }
    caps
}

/// Strip image blocks and append one textual fallback block listing the
/// references, on the last message that carried images.
fn apply_vision_fallback(req: &mut CanonicalRequest) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    let mut last_touched: Option<usize> = None;
    for (i, msg) in req.messages.iter_mut().enumerate() {
        if let MessageContent::Blocks(blocks) = &mut msg.content {
            let before = blocks.len();
            blocks.retain(|b| match b {
                ContentBlock::ImageUrl { image_url } => {
                    refs.push(image_url.clone());
                    false
                }
                _ => true,
            });
            if blocks.len() != before {
                last_touched = Some(i);
            }
        }
    }
    if let (Some(i), false) = (last_touched, refs.is_empty()) {
        let listing = refs.join(", ");
        let block = ContentBlock::text(format!("Vision fallback context: {listing}"));
        match &mut req.messages[i].content {
            MessageContent::Blocks(blocks) => blocks.push(block),
            MessageContent::Text(t) => {
                let text = t.clone();
                req.messages[i].content =
                    MessageContent::Blocks(vec![ContentBlock::text(text), block]);
            }
        }
    }
    refs
}

// ─── Prepare ──────────────────────────────────────────────────────────────────

/// Stages `authorize-token` through `pre-reserve-quota`. Emits
/// `run.started` and the fallback events; returns the (possibly rewritten)
/// request plus the context for execution.
pub fn prepare(
    state: &Arc<RuntimeContext>,
    headers: &HeaderMap,
    client_ip: Option<IpAddr>,
    mut req: CanonicalRequest,
) -> Result<(CanonicalRequest, RequestContext), GatewayError> {
    state.metrics.record_request();
    let run_id = new_run_id();
    let settings = state.settings.get();

    let mode = header_str(headers, "x-cc-mode")
        .map(str::to_string)
        .unwrap_or_else(|| "chat".to_string());
    let session_id = header_str(headers, "x-cc-session-id")
        .map(str::to_string)
        .or_else(|| req.metadata.session_id.clone());

    // Token authorization; only enforced once a token service has tokens.
    let token_value = if state.tokens.is_empty() {
        None
    } else {
        let value = bearer_token(headers)
            .ok_or_else(|| GatewayError::Auth("missing bearer token".into()))?;
        state.tokens.authorize(&value, client_ip, &req.model)?;
        Some(value)
    };

    // Rate limit, keyed by token when present, client address otherwise.
    let rate_key = token_value
        .clone()
        .or_else(|| client_ip.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "anonymous".to_string());
    state.rate_gate().check(&rate_key)?;

    let client_model = req.model.clone();
    let upstream_model = resolve_model(&settings, &mode, &client_model)?;
    let route = select_route(&settings, &req, &mode, &state.scheduler.adapter_names());

    // Capability-aware fallbacks.
    let caps = resolve_capabilities(state, &settings, &req, &upstream_model, &route);
    if req.has_images() && caps.supports_vision == Some(false) {
        let refs = apply_vision_fallback(&mut req);
        state.events.append(
            NewEvent::run(names::VISION_FALLBACK_APPLIED, &run_id)
                .with_data(json!({ "images": refs })),
        );
    }

    let mut effective_loop = req
        .metadata
        .tool_loop_mode
        .as_deref()
        .and_then(ToolLoopMode::parse)
        .unwrap_or(settings.tool_loop.mode);
    if !req.tools.is_empty()
        && caps.supports_tools == Some(false)
        && effective_loop == ToolLoopMode::ClientLoop
    {
        effective_loop = ToolLoopMode::ServerLoop;
        state.events.append(
            NewEvent::run(names::TOOL_FALLBACK_APPLIED, &run_id)
                .with_data(json!({ "reason": "adapter does not support tools" })),
        );
    }

    // Emulation mode: request override, then the loop-mode shorthand,
    // then settings; a tools-incapable upstream never gets native calls.
    let mut emulation = req
        .metadata
        .tool_emulation_mode
        .as_deref()
        .and_then(EmulationMode::parse)
        .unwrap_or(match effective_loop {
            ToolLoopMode::React => EmulationMode::React,
            ToolLoopMode::Json => EmulationMode::Json,
            ToolLoopMode::Hybrid => EmulationMode::Hybrid,
            _ => settings.tool_loop.emulation_mode,
        });
    if caps.supports_tools == Some(false) && emulation == EmulationMode::Native {
        emulation = EmulationMode::Json;
    }

    // Quota reservation: the request's own budget, clamped to at least 1.
    let reservation = match &token_value {
        Some(value) => {
            let amount = i64::from(req.max_tokens).max(1);
            match state.tokens.pre_reserve(value, amount) {
                ReserveOutcome::Ok => Some(Reservation {
                    tokens: state.tokens.clone(),
                    value: value.clone(),
                    amount,
                    run_id: run_id.clone(),
                    settled: false,
                }),
                ReserveOutcome::InsufficientQuota => {
                    return Err(GatewayError::Quota("insufficient quota".into()))
                }
                ReserveOutcome::Disabled => {
                    return Err(GatewayError::Auth("token disabled".into()))
                }
                ReserveOutcome::Expired => {
                    return Err(GatewayError::Auth("token expired".into()))
                }
            }
        }
        None => None,
    };

    let mut started = NewEvent::run(names::RUN_STARTED, &run_id).with_data(json!({
        "mode": mode,
        "client_model": client_model,
        "upstream_model": upstream_model,
        "route": route,
        "stream": req.stream,
    }));
    if let Some(session) = &session_id {
        started = started.with_session(session.clone());
    }
    state.events.append(started);

    debug!(
        run_id,
        mode,
        client_model,
        upstream_model,
        ?route,
        "request prepared"
    );

    Ok((
        req,
        RequestContext {
            run_id,
            session_id,
            mode,
            client_model,
            upstream_model,
            route,
            settings,
            effective_loop,
            emulation,
            started_at: Instant::now(),
            reservation,
            events: state.events.clone(),
            completed: false,
        },
    ))
}

// ─── Execute ──────────────────────────────────────────────────────────────────

fn wants_server_loop(req: &CanonicalRequest, ctx: &RequestContext) -> bool {
    !req.tools.is_empty() && ctx.effective_loop != ToolLoopMode::ClientLoop
}

fn loop_options(req: &CanonicalRequest, ctx: &RequestContext) -> ToolLoopOptions {
    let mut aliases = ctx.settings.tool_aliases.clone();
    for (k, v) in &req.metadata.tool_aliases {
        aliases.insert(k.clone(), v.clone());
    }
    ToolLoopOptions {
        max_steps: req
            .metadata
            .tool_loop_max_steps
            .unwrap_or(ctx.settings.tool_loop.max_steps)
            .max(1),
        emulation: ctx.emulation,
        planner_model: req
            .metadata
            .tool_planner_model
            .clone()
            .or_else(|| ctx.settings.tool_loop.planner_model.clone()),
        aliases,
        allow_experimental: ctx.settings.allow_experimental_tools,
        retries: ctx.retries(req),
        strict_probe_gate: ctx.settings.upstream.strict_probe_gate,
        mcp_ttl: std::time::Duration::from_secs(ctx.settings.mcp_list_tools_ttl_secs),
    }
}

/// Stages `route-to-adapter` through `post-account-quota`. Settles the
/// reservation against actual usage and emits `run.completed`.
pub async fn execute(
    state: &Arc<RuntimeContext>,
    req: CanonicalRequest,
    ctx: &mut RequestContext,
) -> Result<CanonicalResponse, GatewayError> {
    let result = if wants_server_loop(&req, ctx) {
        let tool_loop = ToolLoop {
            scheduler: state.scheduler.clone(),
            catalog: state.catalog.clone(),
            mcp: state.mcp.clone(),
            executor: state.executor.clone(),
            events: state.events.clone(),
        };
        let opts = loop_options(&req, ctx);
        tool_loop
            .run(req.clone(), &ctx.route, &ctx.upstream_model, &opts, &ctx.run_id)
            .await
    } else {
        state
            .scheduler
            .complete_with_retries(
                &ctx.route,
                &req,
                &ctx.upstream_model,
                ctx.retries(&req),
                ctx.settings.upstream.strict_probe_gate,
            )
            .await
    };

    match result {
        Ok(resp) => {
            settle_ok(state, ctx, &resp);
            Ok(resp)
        }
        Err(e) => Err(e),
    }
}

fn settle_ok(state: &Arc<RuntimeContext>, ctx: &mut RequestContext, resp: &CanonicalResponse) {
    ctx.completed = true;
    if let Some(reservation) = ctx.reservation.as_mut() {
        reservation.commit(i64::from(resp.usage.total()));
    }
    state.events.append(
        NewEvent::run(names::RUN_COMPLETED, &ctx.run_id).with_data(json!({
            "status": "ok",
            "input_tokens": resp.usage.input_tokens,
            "output_tokens": resp.usage.output_tokens,
            "stop_reason": resp.stop_reason,
        })),
    );
    state.runs.record(RunSummary {
        run_id: ctx.run_id.clone(),
        session_id: ctx.session_id.clone(),
        mode: ctx.mode.clone(),
        client_model: ctx.client_model.clone(),
        upstream_model: ctx.upstream_model.clone(),
        status: "ok".into(),
        input_tokens: resp.usage.input_tokens,
        output_tokens: resp.usage.output_tokens,
        duration_ms: ctx.started_at.elapsed().as_millis() as u64,
        created_at: chrono::Utc::now().to_rfc3339(),
    });
}

/// Error bookkeeping shared by all handlers. The reservation (if any) is
/// cancelled by its drop guard; this records the counters and the
/// `run.completed` event.
pub fn fail(state: &Arc<RuntimeContext>, ctx: Option<&mut RequestContext>, err: &GatewayError) {
    state.metrics.record_error(err.kind());
    if let Some(ctx) = ctx {
        ctx.completed = true;
        state.events.append(
            NewEvent::run(names::RUN_COMPLETED, &ctx.run_id).with_data(json!({
                "status": "error",
                "error_type": err.kind(),
                "message": err.to_string(),
            })),
        );
        state.runs.record(RunSummary {
            run_id: ctx.run_id.clone(),
            session_id: ctx.session_id.clone(),
            mode: ctx.mode.clone(),
            client_model: ctx.client_model.clone(),
            upstream_model: ctx.upstream_model.clone(),
            status: "error".into(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: ctx.started_at.elapsed().as_millis() as u64,
            created_at: chrono::Utc::now().to_rfc3339(),
        });
    }
}

// ─── Streaming ────────────────────────────────────────────────────────────────

fn sse_response(ctx: &RequestContext, body: Body) -> Response {
    let mut builder = Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache");
    for (name, value) in ctx.response_headers() {
        if let Ok(v) = HeaderValue::from_str(&value) {
            builder = builder.header(name, v);
        }
    }
    builder.body(body).expect("sse response build")
}

fn message_id(dialect: Dialect, run_id: &str) -> String {
    match dialect {
        Dialect::Anthropic => format!("msg_{run_id}"),
        Dialect::OpenAiChat => format!("chatcmpl_{run_id}"),
        Dialect::OpenAiResponses => format!("resp_{run_id}"),
    }
}

fn synthesize_frames(
    dialect: Dialect,
    resp: &CanonicalResponse,
    client_model: &str,
    run_id: &str,
) -> Vec<String> {
    let id = message_id(dialect, run_id);
    let created = chrono::Utc::now().timestamp();
    match dialect {
        Dialect::Anthropic => anthropic::synthesize_stream(resp, client_model, &id),
        Dialect::OpenAiChat => openai::synthesize_stream(resp, client_model, &id, created),
        Dialect::OpenAiResponses => responses::synthesize_stream(resp, client_model, &id, created),
    }
}

/// Whether the picked adapter's wire dialect matches the client's, so its
/// SSE payloads can be forwarded byte-accurately.
fn passthrough_ok(dialect: Dialect, kind: AdapterKind) -> bool {
    match dialect {
        Dialect::Anthropic => matches!(kind, AdapterKind::Anthropic | AdapterKind::Mock | AdapterKind::Script),
        Dialect::OpenAiChat => matches!(kind, AdapterKind::Openai | AdapterKind::Mock | AdapterKind::Script),
        // The responses envelope is always synthesised.
        Dialect::OpenAiResponses => false,
    }
}

/// Pull usage numbers out of stream events so pass-through requests still
/// settle their quota against actual consumption.
fn usage_from_event(ev: &StreamEvent, input: &mut u32, output: &mut u32) {
    match ev {
        StreamEvent::MessageStart { usage, .. } => *input = (*input).max(usage.input_tokens),
        StreamEvent::MessageDelta { usage: Some(u), .. } => {
            *output = (*output).max(u.output_tokens)
        }
        StreamEvent::Passthrough { raw, .. } => {
            if let Ok(v) = serde_json::from_slice::<serde_json::Value>(raw) {
                if let Some(n) = v["message"]["usage"]["input_tokens"].as_u64() {
                    *input = (*input).max(n as u32);
                }
                if let Some(n) = v["usage"]["output_tokens"].as_u64() {
                    *output = (*output).max(n as u32);
                }
                if let Some(n) = v["usage"]["prompt_tokens"].as_u64() {
                    *input = (*input).max(n as u32);
                }
                if let Some(n) = v["usage"]["completion_tokens"].as_u64() {
                    *output = (*output).max(n as u32);
                }
            }
        }
        _ => {}
    }
}

/// Build the streaming response for one prepared request.
///
/// Server-loop requests and dialect mismatches run to completion first and
/// stream a synthesised envelope; everything else forwards the upstream
/// stream, rewriting only the model name. A failure after the stream has
/// started closes with the dialect's clean error trailer instead of a
/// broken HTTP body.
pub async fn streaming_response(
    state: Arc<RuntimeContext>,
    req: CanonicalRequest,
    mut ctx: RequestContext,
    dialect: Dialect,
) -> Result<Response, GatewayError> {
    // Synthesised path: tool loop, or an upstream speaking another dialect.
    let direct_adapter = state
        .scheduler
        .pick(&ctx.route, ctx.settings.upstream.strict_probe_gate, &HashSet::new())
        .ok();
    let synthesize = wants_server_loop(&req, &ctx)
        || direct_adapter
            .as_ref()
            .map(|a| !passthrough_ok(dialect, a.kind()))
            .unwrap_or(true);

    if synthesize {
        let resp = match execute(&state, req, &mut ctx).await {
            Ok(resp) => resp,
            Err(e) => {
                fail(&state, Some(&mut ctx), &e);
                return Err(e);
            }
        };
        let frames = synthesize_frames(dialect, &resp, &ctx.client_model, &ctx.run_id);
        let stream = futures::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok::<_, std::convert::Infallible>(f.into_bytes())),
        );
        return Ok(sse_response(&ctx, Body::from_stream(stream)));
    }

    let retries = ctx.retries(&req);
    let opened = state
        .scheduler
        .stream_with_retries(
            &ctx.route,
            &req,
            &ctx.upstream_model,
            retries,
            ctx.settings.upstream.strict_probe_gate,
        )
        .await;
    let (_adapter, upstream) = match opened {
        Ok(v) => v,
        Err(e) => {
            fail(&state, Some(&mut ctx), &e);
            return Err(e);
        }
    };

    let client_model = ctx.client_model.clone();
    let run_id = ctx.run_id.clone();
    let msg_id = message_id(dialect, &run_id);
    let created = chrono::Utc::now().timestamp();
    let state_for_stream = state.clone();
    let mut input_tokens: u32 = 0;
    let mut output_tokens: u32 = 0;
    // The context (and its reservation guard) moves into the stream
    // closure so a dropped connection still cancels the reservation.
    let mut ctx = ctx;
    let response_headers = ctx.response_headers();

    let body_stream = async_stream_frames(upstream, move |item| match item {
        StreamItem::Event(ev) => {
            usage_from_event(&ev, &mut input_tokens, &mut output_tokens);
            match dialect {
                Dialect::Anthropic => anthropic::encode_stream_event(&ev, &client_model, &msg_id),
                Dialect::OpenAiChat => {
                    openai::encode_stream_event(&ev, &client_model, &msg_id, created)
                }
                Dialect::OpenAiResponses => None,
            }
        }
        StreamItem::Error(e) => {
            warn!(run_id = %run_id, error = %e, "stream failed mid-flight");
            state_for_stream.metrics.record_error("upstream_unavailable");
            Some(match dialect {
                Dialect::Anthropic => anthropic::error_trailer().join(""),
                _ => vaxel_wire::stream::SSE_DONE.to_string(),
            })
        }
        StreamItem::End => {
            let resp = CanonicalResponse {
                model: ctx.upstream_model.clone(),
                blocks: vec![],
                stop_reason: vaxel_wire::StopReason::EndTurn,
                usage: vaxel_wire::Usage {
                    input_tokens,
                    output_tokens,
                },
            };
            settle_ok(&state_for_stream, &mut ctx, &resp);
            None
        }
    });

    let mut builder = Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache");
    for (name, value) in response_headers {
        if let Ok(v) = HeaderValue::from_str(&value) {
            builder = builder.header(name, v);
        }
    }
    Ok(builder
        .body(Body::from_stream(body_stream))
        .expect("sse response build"))
}

enum StreamItem {
    Event(StreamEvent),
    Error(AdapterError),
    End,
}

/// Adapt an upstream event stream into SSE body bytes through `encode`,
/// appending a final `End` marker so accounting runs exactly once.
fn async_stream_frames(
    upstream: vaxel_route::EventStream,
    mut encode: impl FnMut(StreamItem) -> Option<String> + Send + 'static,
) -> impl futures::Stream<Item = Result<Vec<u8>, std::convert::Infallible>> + Send {
    upstream
        .map(|item| match item {
            Ok(ev) => StreamItem::Event(ev),
            Err(e) => StreamItem::Error(e),
        })
        .chain(futures::stream::iter(vec![StreamItem::End]))
        .filter_map(move |item| {
            let frame = encode(item);
            async move { frame.map(|f| Ok(f.into_bytes())) }
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use vaxel_wire::{Message, RequestMetadata};

    use super::*;
    use crate::test_support::test_state;

    fn request(model: &str, max_tokens: u32) -> CanonicalRequest {
        CanonicalRequest {
            model: model.into(),
            messages: vec![Message::user("hello gateway")],
            system: None,
            tools: vec![],
            max_tokens,
            stream: false,
            metadata: RequestMetadata::default(),
        }
    }

    #[tokio::test]
    async fn prepare_and_execute_round_trip() {
        let state = test_state();
        let (req, mut ctx) = prepare(&state, &HeaderMap::new(), None, request("claude-test", 64))
            .unwrap();
        assert_eq!(ctx.client_model, "claude-test");
        assert_eq!(ctx.upstream_model, "claude-test");
        let resp = execute(&state, req, &mut ctx).await.unwrap();
        assert!(resp.joined_text().contains("hello gateway"));
        // run.started + run.completed present
        let types: Vec<String> = state
            .events
            .list(&Default::default())
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&names::RUN_STARTED.to_string()));
        assert!(types.contains(&names::RUN_COMPLETED.to_string()));
        assert_eq!(state.runs.list(10).len(), 1);
    }

    #[tokio::test]
    async fn mode_header_selects_mode() {
        let state = test_state();
        let mut headers = HeaderMap::new();
        headers.insert("x-cc-mode", "plan".parse().unwrap());
        let (_, ctx) = prepare(&state, &headers, None, request("m", 1)).unwrap();
        assert_eq!(ctx.mode, "plan");
    }

    #[tokio::test]
    async fn strict_mapping_rejects_before_any_reservation() {
        let state = test_state();
        let mut s = state.settings.get();
        s.model_map_strict = true;
        s.model_mappings.insert("known".into(), "upstream".into());
        state.settings.put(s);
        // Token service configured with a token so a reservation *could*
        // happen; it must not.
        let token = vaxel_quota::Token::new("tok", "u", 100);
        state.tokens.insert_token(token);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok".parse().unwrap());
        let err = prepare(&state, &headers, None, request("unknown-model", 64)).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        let t = state.tokens.get_token("tok").unwrap();
        assert_eq!(t.used, 0, "no reservation may survive a mapping rejection");
    }

    #[tokio::test]
    async fn quota_exhaustion_is_quota_error_without_bucket_mutation() {
        let state = test_state();
        state
            .tokens
            .insert_token(vaxel_quota::Token::new("small", "u", 5));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer small".parse().unwrap());
        let err = prepare(&state, &headers, None, request("m", 64)).unwrap_err();
        assert!(matches!(err, GatewayError::Quota(_)));
        assert_eq!(state.tokens.get_token("small").unwrap().used, 0);
    }

    #[tokio::test]
    async fn missing_token_is_auth_error_when_service_configured() {
        let state = test_state();
        state
            .tokens
            .insert_token(vaxel_quota::Token::new("tok", "u", 0));
        let err = prepare(&state, &HeaderMap::new(), None, request("m", 1)).unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[tokio::test]
    async fn successful_run_commits_actual_usage() {
        let state = test_state();
        state
            .tokens
            .insert_token(vaxel_quota::Token::new("tok", "u", 1000));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok".parse().unwrap());
        let (req, mut ctx) = prepare(&state, &headers, None, request("m", 500)).unwrap();
        let resp = execute(&state, req, &mut ctx).await.unwrap();
        let t = state.tokens.get_token("tok").unwrap();
        assert_eq!(t.used, i64::from(resp.usage.total()));
        assert!(t.used < 500, "excess reservation must be refunded");
    }

    #[tokio::test]
    async fn dropped_context_cancels_reservation() {
        let state = test_state();
        state
            .tokens
            .insert_token(vaxel_quota::Token::new("tok", "u", 1000));
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok".parse().unwrap());
        {
            let _prepared = prepare(&state, &headers, None, request("m", 500)).unwrap();
            assert_eq!(state.tokens.get_token("tok").unwrap().used, 500);
            // Dropped here without execute — simulates a disconnect.
        }
        assert_eq!(state.tokens.get_token("tok").unwrap().used, 0);
        let completed = state.events.list(&vaxel_events::EventFilter {
            event_type: Some(names::RUN_COMPLETED.into()),
            ..Default::default()
        });
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].data["status"], "cancelled");
    }

    #[tokio::test]
    async fn vision_fallback_strips_images_and_emits_event() {
        let state = test_state();
        let mut s = state.settings.get();
        s.vision_support_hints.insert("text-only-*".into(), false);
        state.settings.put(s);
        let mut req = request("text-only-model", 16);
        req.messages = vec![Message::user_blocks(vec![
            ContentBlock::text("what is this"),
            ContentBlock::image("https://x/img.png"),
        ])];
        let (req, _ctx) = prepare(&state, &HeaderMap::new(), None, req).unwrap();
        assert!(!req.has_images());
        let text = req.messages[0].content.joined_text();
        assert!(text.contains("Vision fallback context:"));
        assert!(text.contains("https://x/img.png"));
        let events = state.events.list(&vaxel_events::EventFilter {
            event_type: Some(names::VISION_FALLBACK_APPLIED.into()),
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn vision_kept_when_capability_unknown() {
        let state = test_state();
        let mut req = request("mystery-model", 16);
        req.messages = vec![Message::user_blocks(vec![ContentBlock::image(
            "https://x/a.png",
        )])];
        let (req, _) = prepare(&state, &HeaderMap::new(), None, req).unwrap();
        assert!(req.has_images(), "unknown capability keeps images");
    }

    #[tokio::test]
    async fn metadata_override_forces_vision_fallback() {
        let state = test_state();
        let mut req = request("any-model", 16);
        req.metadata.upstream_supports_vision = Some(false);
        req.messages = vec![Message::user_blocks(vec![ContentBlock::image(
            "https://x/a.png",
        )])];
        let (req, _) = prepare(&state, &HeaderMap::new(), None, req).unwrap();
        assert!(!req.has_images());
    }

    #[tokio::test]
    async fn tools_incapable_adapter_triggers_server_loop_fallback() {
        let state = crate::test_support::test_state_with_toolless_adapter();
        let mut req = request("m", 16);
        req.tools = vec![vaxel_wire::ToolSpec {
            name: "get_weather".into(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }];
        let (_, ctx) = prepare(&state, &HeaderMap::new(), None, req).unwrap();
        assert_eq!(ctx.effective_loop, ToolLoopMode::ServerLoop);
        let events = state.events.list(&vaxel_events::EventFilter {
            event_type: Some(names::TOOL_FALLBACK_APPLIED.into()),
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
        // Native emulation is impossible without tool support.
        assert_ne!(ctx.emulation, EmulationMode::Native);
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_is_rate_limited() {
        let state = test_state();
        state.replace_rate_gate(vaxel_quota::RateGate::new(1, 1));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(prepare(&state, &HeaderMap::new(), Some(ip), request("m", 1)).is_ok());
        let err = prepare(&state, &HeaderMap::new(), Some(ip), request("m", 1)).unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited(_)));
    }

    #[tokio::test]
    async fn fail_records_error_metrics_and_run() {
        let state = test_state();
        let (_, mut ctx) = prepare(&state, &HeaderMap::new(), None, request("m", 1)).unwrap();
        fail(&state, Some(&mut ctx), &GatewayError::UpstreamUnavailable("x".into()));
        assert_eq!(
            state
                .metrics
                .errors_total
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        let runs = state.runs.list(10);
        assert_eq!(runs[0].status, "error");
    }
}
