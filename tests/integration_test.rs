// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the gateway HTTP surface, driven through the axum
/// router with mock and scripted adapters — no network anywhere.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use vaxel_quota::{RateGate, Token, TokenService};
use vaxel_route::{
    ChannelStore, HealthRegistry, MockAdapter, ScriptedAdapter, Scheduler, UpstreamAdapter,
};
use vaxel_server::{
    backend::MemoryBackend,
    router,
    state::{AdminToken, Metrics, RunStore, RuntimeContext},
};
use vaxel_settings::{CapabilityHints, RuntimeSettings, SettingsStore, ToolLoopMode};
use vaxel_wire::{AssistantBlock, CanonicalResponse, StopReason, Usage};

// ─── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    state: Arc<RuntimeContext>,
    app: axum::Router,
}

fn harness_with(
    adapter: Arc<dyn UpstreamAdapter>,
    mutate: impl FnOnce(&mut RuntimeSettings),
) -> Harness {
    let mut settings = RuntimeSettings::default();
    mutate(&mut settings);
    let (registry, _) = HealthRegistry::new(3, Duration::from_secs(60));
    let scheduler = Arc::new(Scheduler::new(registry));
    scheduler.register(adapter);
    let state = Arc::new(RuntimeContext {
        settings: Arc::new(SettingsStore::new(settings)),
        events: vaxel_events::EventStore::shared(),
        scheduler,
        tokens: Arc::new(TokenService::new()),
        rate: std::sync::RwLock::new(Arc::new(RateGate::new(10_000, 10_000))),
        catalog: Arc::new(vaxel_loop::ToolCatalog::new()),
        mcp: Arc::new(vaxel_loop::McpRegistry::new()),
        channels: Arc::new(ChannelStore::new()),
        backend: Arc::new(MemoryBackend::new()),
        executor: None,
        admin_token: Some(AdminToken::new("admin-secret")),
        metrics: Metrics::default(),
        runs: RunStore::default(),
        started_at: std::time::Instant::now(),
        admin_ui_dist_dir: None,
    });
    let app = router(state.clone())
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))));
    Harness { state, app }
}

fn harness() -> Harness {
    harness_with(Arc::new(MockAdapter::new("mock")), |_| {})
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value, axum::http::HeaderMap) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value, headers)
}

fn anthropic_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("anthropic-version", "2023-06-01")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ─── Scenario: Anthropic non-stream, identity mapping ─────────────────────────

#[tokio::test]
async fn anthropic_identity_mapping_round_trip() {
    let h = harness();
    let (status, body, headers) = send(
        &h.app,
        anthropic_request(json!({
            "model": "claude-test",
            "max_tokens": 128,
            "messages": [{"role": "user", "content": "hello gateway"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert!(!body["content"].as_array().unwrap().is_empty());
    assert_eq!(headers["x-cc-requested-model"], "claude-test");
    assert_eq!(headers["x-cc-upstream-model"], "claude-test");
    assert!(headers.contains_key("x-cc-run-id"));
    assert_eq!(headers["x-cc-mode"], "chat");
}

#[tokio::test]
async fn anthropic_requires_version_header() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"model": "m", "max_tokens": 1,
                   "messages": [{"role": "user", "content": "x"}]})
            .to_string(),
        ))
        .unwrap();
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

// ─── Scenario: OpenAI tool-calls pass-through ─────────────────────────────────

#[tokio::test]
async fn openai_tool_calls_pass_through() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "scripted",
        vec![Ok(CanonicalResponse {
            model: "upstream".into(),
            blocks: vec![AssistantBlock::tool_use(
                "call_1",
                "get_weather",
                json!({"city": "Oslo"}),
            )],
            stop_reason: StopReason::ToolUse,
            usage: Usage {
                input_tokens: 3,
                output_tokens: 2,
            },
        })],
    ));
    let h = harness_with(adapter, |_| {});
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-test",
                "tools": [{"type": "function", "function": {
                    "name": "get_weather", "description": "w",
                    "parameters": {"type": "object"}}}],
                "messages": [{"role": "user", "content": "please use tool"}]
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    let calls = body["choices"][0]["message"]["tool_calls"].as_array().unwrap();
    assert!(!calls.is_empty());
    assert_eq!(calls[0]["function"]["name"], "get_weather");
}

// ─── Scenario: server-side tool loop, two turns ───────────────────────────────

#[tokio::test]
async fn server_loop_runs_two_turns() {
    let adapter = Arc::new(ScriptedAdapter::tool_then_text(
        "scripted",
        "toolu_1",
        "get_weather",
        json!({"city": "Oslo"}),
        "rainy, 8 degrees",
    ));
    let h = harness_with(adapter.clone(), |s| {
        s.tool_loop.mode = ToolLoopMode::ServerLoop;
        s.tool_loop.max_steps = 3;
    });
    let (status, body, _) = send(
        &h.app,
        anthropic_request(json!({
            "model": "claude-test",
            "max_tokens": 64,
            "tools": [{"name": "get_weather", "description": "w",
                       "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "weather in Oslo?"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["content"][0]["text"], "rainy, 8 degrees");
    assert_eq!(adapter.call_count(), 2, "adapter invoked exactly twice");

    // The second turn's input carried the linked tool_result block.
    let second = adapter.last_request.lock().unwrap().clone().unwrap();
    let linked = second.messages.iter().any(|m| {
        m.content.blocks().iter().any(|b| {
            matches!(b, vaxel_wire::ContentBlock::ToolResult { tool_use_id, .. }
                if tool_use_id == "toolu_1")
        })
    });
    assert!(linked);
}

// ─── Scenario: capability auto-fallback with streaming ────────────────────────

#[tokio::test]
async fn toolless_adapter_falls_back_to_server_loop_stream() {
    let adapter = Arc::new(
        ScriptedAdapter::new(
            "scripted",
            vec![Ok(CanonicalResponse {
                model: "upstream-x".into(),
                blocks: vec![AssistantBlock::text("no tools needed after all")],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            })],
        )
        .with_capabilities(CapabilityHints {
            supports_tools: Some(false),
            supports_vision: None,
        }),
    );
    let h = harness_with(adapter, |_| {});
    let resp = h
        .app
        .clone()
        .oneshot(anthropic_request(json!({
            "model": "claude-test",
            "max_tokens": 64,
            "stream": true,
            "tools": [{"name": "get_weather", "description": "w",
                       "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    let text =
        String::from_utf8(resp.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
    // Synthesised envelope names the client-requested model.
    assert!(text.contains("event: message_start"));
    assert!(text.contains("\"model\":\"claude-test\""));
    assert!(!text.contains("upstream-x"));
    assert!(text.contains("event: message_stop"));

    let fallbacks = h.state.events.list(&vaxel_events::EventFilter {
        event_type: Some("tool.fallback_applied".into()),
        ..Default::default()
    });
    assert_eq!(fallbacks.len(), 1);
}

// ─── Scenario: quota exhaustion ───────────────────────────────────────────────

#[tokio::test]
async fn quota_exhaustion_rejects_before_dispatch() {
    let adapter = Arc::new(ScriptedAdapter::always_text("scripted", "unused"));
    let h = harness_with(adapter.clone(), |_| {});
    h.state.tokens.insert_token(Token::new("tok-small", "u1", 5));

    let mut req = anthropic_request(json!({
        "model": "claude-test",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "hi"}]
    }));
    req.headers_mut()
        .insert("authorization", "Bearer tok-small".parse().unwrap());
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "quota_error");
    assert_eq!(adapter.call_count(), 0, "no adapter invocation");
    assert_eq!(
        h.state.tokens.get_token("tok-small").unwrap().used,
        0,
        "no bucket mutation observable"
    );
}

// ─── Scenario: strict model mapping ───────────────────────────────────────────

#[tokio::test]
async fn strict_mapping_rejects_unknown_model() {
    let adapter = Arc::new(ScriptedAdapter::always_text("scripted", "unused"));
    let h = harness_with(adapter.clone(), |s| {
        s.model_map_strict = true;
        s.model_mappings.insert("known".into(), "upstream".into());
    });
    let (status, body, _) = send(
        &h.app,
        anthropic_request(json!({
            "model": "unknown-model",
            "max_tokens": 8,
            "messages": [{"role": "user", "content": "hi"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(adapter.call_count(), 0);
}

// ─── Streaming ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn streaming_mock_adapter_produces_full_envelope() {
    let h = harness();
    let resp = h
        .app
        .clone()
        .oneshot(anthropic_request(json!({
            "model": "claude-test",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "stream me"}]
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text =
        String::from_utf8(resp.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
    for event in [
        "message_start",
        "content_block_start",
        "content_block_delta",
        "content_block_stop",
        "message_delta",
        "message_stop",
    ] {
        assert!(text.contains(&format!("event: {event}")), "missing {event}");
    }
    assert!(text.contains("stream me"));
}

#[tokio::test]
async fn openai_stream_terminates_with_done() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-test",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text =
        String::from_utf8(resp.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn responses_endpoint_function_call_round_trip() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/responses")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "gpt-test",
                "input": [
                    {"type": "message", "role": "user", "content": "go"},
                    {"type": "function_call", "call_id": "fc_1", "name": "grep",
                     "arguments": "{\"q\":\"x\"}"},
                    {"type": "function_call_output", "call_id": "fc_1", "output": "found"}
                ]
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "response");
    assert_eq!(body["status"], "completed");
}

// ─── Misc surface ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn count_tokens_uses_four_char_heuristic() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/messages/count_tokens")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "m",
                "messages": [{"role": "user", "content": "12345678"}]
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["input_tokens"], 2);
}

#[tokio::test]
async fn healthz_and_metrics_respond() {
    let h = harness();
    let resp = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Run one request so the counters move.
    send(
        &h.app,
        anthropic_request(json!({
            "model": "m", "max_tokens": 1,
            "messages": [{"role": "user", "content": "x"}]
        })),
    )
    .await;
    let resp = h
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let text =
        String::from_utf8(resp.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
    assert!(text.contains("vaxel_requests_total 1"));
    assert!(text.contains("vaxel_adapter_failure_count{adapter=\"mock\"} 0"));
}

#[tokio::test]
async fn admin_requires_token() {
    let h = harness();
    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/settings")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/admin/settings")
                .header("x-admin-token", "admin-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_rejects_unknown_top_level_fields() {
    let h = harness();
    let req = Request::builder()
        .method("PUT")
        .uri("/admin/model-mapping")
        .header("content-type", "application/json")
        .header("x-admin-token", "admin-secret")
        .body(Body::from(
            json!({"mappings": {}, "surprise_field": 1}).to_string(),
        ))
        .unwrap();
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
    let events = h.state.events.list(&vaxel_events::EventFilter {
        event_type: Some("request.unsupported_fields".into()),
        ..Default::default()
    });
    assert_eq!(events.len(), 1);
    let curl = events[0].data["curl_command"].as_str().unwrap();
    assert!(curl.contains("[REDACTED]"), "admin token must be redacted");
    assert!(!curl.contains("admin-secret"));
}

#[tokio::test]
async fn events_api_lists_run_lifecycle() {
    let h = harness();
    send(
        &h.app,
        anthropic_request(json!({
            "model": "m", "max_tokens": 1,
            "messages": [{"role": "user", "content": "x"}]
        })),
    )
    .await;
    let req = Request::builder()
        .uri("/v1/cc/events?event_type=run.completed")
        .header("x-admin-token", "admin-secret")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["data"]["status"], "ok");
}

#[tokio::test]
async fn trailing_garbage_is_rejected() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("anthropic-version", "2023-06-01")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"model":"m","max_tokens":1,"messages":[{"role":"user","content":"x"}]} {"extra":1}"#,
        ))
        .unwrap();
    let (status, body, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
    let events = h.state.events.list(&vaxel_events::EventFilter {
        event_type: Some("request.decode_failed".into()),
        ..Default::default()
    });
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn scheduler_failover_shifts_traffic_to_healthy_adapter() {
    // Two adapters in the default route; the first always fails.
    let mut settings = RuntimeSettings::default();
    settings.routing.retries = 2;
    settings.upstream.failure_threshold = 2;
    let (registry, _) = HealthRegistry::new(2, Duration::from_secs(60));
    let scheduler = Arc::new(Scheduler::new(registry));
    let flaky = Arc::new(ScriptedAdapter::always_failing("flaky"));
    let steady = Arc::new(ScriptedAdapter::new(
        "steady",
        (0..10)
            .map(|_| {
                Ok(CanonicalResponse {
                    model: "m".into(),
                    blocks: vec![AssistantBlock::text("ok")],
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::default(),
                })
            })
            .collect(),
    ));
    scheduler.register(flaky.clone());
    scheduler.register(steady.clone());
    let state = Arc::new(RuntimeContext {
        settings: Arc::new(SettingsStore::new(settings)),
        events: vaxel_events::EventStore::shared(),
        scheduler,
        tokens: Arc::new(TokenService::new()),
        rate: std::sync::RwLock::new(Arc::new(RateGate::new(10_000, 10_000))),
        catalog: Arc::new(vaxel_loop::ToolCatalog::new()),
        mcp: Arc::new(vaxel_loop::McpRegistry::new()),
        channels: Arc::new(ChannelStore::new()),
        backend: Arc::new(MemoryBackend::new()),
        executor: None,
        admin_token: None,
        metrics: Metrics::default(),
        runs: RunStore::default(),
        started_at: std::time::Instant::now(),
        admin_ui_dist_dir: None,
    });
    let app = router(state.clone())
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4242))));

    for _ in 0..4 {
        let (status, body, _) = send(
            &app,
            anthropic_request(json!({
                "model": "m", "max_tokens": 1,
                "messages": [{"role": "user", "content": "x"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"][0]["text"], "ok");
    }
    // The flaky adapter tripped its threshold and stopped being attempted.
    let flaky_calls = flaky.call_count();
    assert!(flaky_calls >= 2, "flaky adapter was attempted at first");
    let snapshot = state.scheduler.registry().snapshot();
    let flaky_health = snapshot.iter().find(|s| s.adapter == "flaky").unwrap();
    assert!(flaky_health.cooldown_remaining_secs > 0);
}
