// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use futures::stream;
use vaxel_settings::{AdapterKind, AdapterSpec, CapabilityHints};
use vaxel_wire::{
    AssistantBlock, BlockDelta, CanonicalRequest, CanonicalResponse, StopReason, StreamEvent,
    Usage,
};

use crate::adapter::{AdapterError, EventStream, UpstreamAdapter};

/// Deterministic mock adapter for tests. Echoes the last user message back
/// as the assistant response.
pub struct MockAdapter {
    name: String,
    capabilities: CapabilityHints,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: CapabilityHints::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityHints) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn reply_for(&self, req: &CanonicalRequest, upstream_model: &str) -> CanonicalResponse {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == vaxel_wire::Role::User)
            .map(|m| m.content.joined_text())
            .unwrap_or_else(|| "[no input]".into());
        CanonicalResponse {
            model: upstream_model.to_string(),
            blocks: vec![AssistantBlock::text(format!("MOCK: {reply}"))],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: req.approx_input_tokens(),
                output_tokens: 10,
            },
        }
    }
}

#[async_trait]
impl UpstreamAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Mock
    }

    fn capabilities(&self) -> CapabilityHints {
        self.capabilities
    }

    async fn complete(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<CanonicalResponse, AdapterError> {
        Ok(self.reply_for(req, upstream_model))
    }

    async fn stream(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<EventStream, AdapterError> {
        Ok(stream_response(self.reply_for(req, upstream_model)))
    }
}

/// Turn a finished response into the structured event sequence a real
/// streaming upstream would have produced.
pub fn stream_response(resp: CanonicalResponse) -> EventStream {
    let mut events: Vec<Result<StreamEvent, AdapterError>> = Vec::new();
    events.push(Ok(StreamEvent::MessageStart {
        model: resp.model.clone(),
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: 0,
        },
    }));
    for (i, block) in resp.blocks.iter().enumerate() {
        let index = i as u32;
        match block {
            AssistantBlock::Text { text } => {
                events.push(Ok(StreamEvent::ContentBlockStart {
                    index,
                    block: serde_json::json!({"type": "text", "text": ""}),
                }));
                events.push(Ok(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text: text.clone() },
                }));
            }
            AssistantBlock::ToolUse { id, name, input } => {
                events.push(Ok(StreamEvent::ContentBlockStart {
                    index,
                    block: serde_json::json!({
                        "type": "tool_use", "id": id, "name": name, "input": {}
                    }),
                }));
                events.push(Ok(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: input.to_string(),
                    },
                }));
            }
        }
        events.push(Ok(StreamEvent::ContentBlockStop { index }));
    }
    events.push(Ok(StreamEvent::MessageDelta {
        stop_reason: Some(resp.stop_reason),
        usage: Some(resp.usage),
    }));
    events.push(Ok(StreamEvent::MessageStop));
    Box::pin(stream::iter(events))
}

/// A pre-scripted adapter. Each `complete` call pops the next response off
/// the front of the queue, so tests can specify exact multi-turn behavior
/// — including tool calls — without network access.
pub struct ScriptedAdapter {
    name: String,
    scripts: Mutex<Vec<Result<CanonicalResponse, AdapterError>>>,
    capabilities: CapabilityHints,
    calls: AtomicU32,
    /// Returned for every call once the script queue is drained; `None`
    /// falls back to a placeholder text response.
    default_error: Option<AdapterError>,
    /// The last request seen, for assertions on what was actually sent.
    pub last_request: Arc<Mutex<Option<CanonicalRequest>>>,
    /// Upstream model names in call order.
    pub models_seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAdapter {
    pub fn new(
        name: impl Into<String>,
        scripts: Vec<Result<CanonicalResponse, AdapterError>>,
    ) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(scripts),
            capabilities: CapabilityHints::default(),
            calls: AtomicU32::new(0),
            default_error: None,
            last_request: Arc::new(Mutex::new(None)),
            models_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityHints) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Convenience: always answer with one text block.
    pub fn always_text(name: impl Into<String>, reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(
            name,
            vec![Ok(text_response("scripted-model", &reply))],
        )
    }

    /// Convenience: a tool call on the first turn, text on the second.
    pub fn tool_then_text(
        name: impl Into<String>,
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            vec![
                Ok(CanonicalResponse {
                    model: "scripted-model".into(),
                    blocks: vec![AssistantBlock::tool_use(tool_id, tool_name, args)],
                    stop_reason: StopReason::ToolUse,
                    usage: Usage {
                        input_tokens: 5,
                        output_tokens: 5,
                    },
                }),
                Ok(text_response("scripted-model", &final_text.into())),
            ],
        )
    }

    /// Convenience: every call fails with a transient error.
    pub fn always_failing(name: impl Into<String>) -> Self {
        let mut adapter = Self::new(name, vec![]);
        adapter.default_error = Some(AdapterError::Transient("injected failure".into()));
        adapter
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<CanonicalResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().expect("last_request poisoned") = Some(req.clone());
        self.models_seen
            .lock()
            .expect("models_seen poisoned")
            .push(upstream_model.to_string());
        let mut scripts = self.scripts.lock().expect("scripts poisoned");
        if scripts.is_empty() {
            match &self.default_error {
                Some(err) => Err(err.clone()),
                None => Ok(text_response("scripted-model", "[no more scripts]")),
            }
        } else {
            scripts.remove(0)
        }
    }
}

fn text_response(model: &str, text: &str) -> CanonicalResponse {
    CanonicalResponse {
        model: model.into(),
        blocks: vec![AssistantBlock::text(text)],
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens: 5,
            output_tokens: 5,
        },
    }
}

#[async_trait]
impl UpstreamAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Script
    }

    fn capabilities(&self) -> CapabilityHints {
        self.capabilities
    }

    async fn complete(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<CanonicalResponse, AdapterError> {
        self.next(req, upstream_model)
    }

    async fn stream(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<EventStream, AdapterError> {
        Ok(stream_response(self.next(req, upstream_model)?))
    }
}

/// Build a mock or scripted adapter from its settings spec. A `script`
/// value holds an array of canonical responses played back in order.
pub fn from_spec(spec: &AdapterSpec) -> anyhow::Result<Arc<dyn UpstreamAdapter>> {
    match spec.kind {
        AdapterKind::Mock => Ok(Arc::new(
            MockAdapter::new(&spec.name).with_capabilities(spec.capabilities),
        )),
        AdapterKind::Script => {
            let scripts: Vec<CanonicalResponse> = match &spec.script {
                Some(v) => serde_json::from_value(v.clone())?,
                None => Vec::new(),
            };
            Ok(Arc::new(
                ScriptedAdapter::new(&spec.name, scripts.into_iter().map(Ok).collect())
                    .with_capabilities(spec.capabilities),
            ))
        }
        other => anyhow::bail!("from_spec only builds mock/script adapters, got {other:?}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;
    use vaxel_wire::Message;

    use super::*;

    fn req(text: &str) -> CanonicalRequest {
        CanonicalRequest {
            model: "m".into(),
            messages: vec![Message::user(text)],
            system: None,
            tools: vec![],
            max_tokens: 16,
            stream: false,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let adapter = MockAdapter::new("mock");
        let resp = adapter.complete(&req("hi"), "mock-model").await.unwrap();
        assert_eq!(resp.joined_text(), "MOCK: hi");
        assert_eq!(resp.model, "mock-model");
    }

    #[tokio::test]
    async fn mock_stream_ends_with_message_stop() {
        let adapter = MockAdapter::new("mock");
        let mut s = adapter.stream(&req("hi"), "mock-model").await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = s.next().await {
            events.push(ev.unwrap());
        }
        assert!(matches!(events.first(), Some(StreamEvent::MessageStart { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_calls() {
        let adapter = ScriptedAdapter::tool_then_text(
            "s",
            "toolu_1",
            "get_weather",
            json!({"city": "Oslo"}),
            "done",
        );
        let first = adapter.complete(&req("go"), "m").await.unwrap();
        assert!(first.has_tool_use());
        let second = adapter.complete(&req("go"), "m").await.unwrap();
        assert_eq!(second.joined_text(), "done");
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn scripted_captures_last_request() {
        let adapter = ScriptedAdapter::always_text("s", "ok");
        adapter.complete(&req("payload"), "m").await.unwrap();
        let captured = adapter.last_request.lock().unwrap();
        assert_eq!(
            captured.as_ref().unwrap().messages[0].as_text(),
            Some("payload")
        );
    }

    #[tokio::test]
    async fn scripted_fallback_after_exhaustion() {
        let adapter = ScriptedAdapter::new("s", vec![]);
        let resp = adapter.complete(&req("x"), "m").await.unwrap();
        assert!(resp.joined_text().contains("no more scripts"));
    }

    #[tokio::test]
    async fn always_failing_returns_transient_errors() {
        let adapter = ScriptedAdapter::always_failing("bad");
        let err = adapter.complete(&req("x"), "m").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn from_spec_builds_scripted_adapter() {
        let spec = AdapterSpec {
            name: "scripted".into(),
            kind: AdapterKind::Script,
            base_url: None,
            api_key_env: None,
            extra_headers: vec![],
            capabilities: CapabilityHints {
                supports_tools: Some(false),
                supports_vision: None,
            },
            script: Some(json!([{
                "model": "m",
                "blocks": [{"type": "text", "text": "scripted hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }])),
        };
        let adapter = from_spec(&spec).unwrap();
        assert_eq!(adapter.name(), "scripted");
        assert_eq!(adapter.capabilities().supports_tools, Some(false));
    }
}
