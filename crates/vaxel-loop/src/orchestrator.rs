// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The server-side tool loop.
//!
//! Instead of returning the first model output to the client, the loop
//! executes every requested tool, appends the results to its private
//! message accumulator, and asks the model again — up to `max_steps`
//! turns. Turns are strictly serial; tool failures never escape as request
//! errors, they come back to the model as `tool_result{is_error}` blocks.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::{json, Value};
use tracing::{debug, info};
use vaxel_events::{names, EventStore, NewEvent};
use vaxel_settings::EmulationMode;
use vaxel_route::Scheduler;
use vaxel_wire::{
    AssistantBlock, CanonicalRequest, CanonicalResponse, ContentBlock, GatewayError, Message,
    StopReason, SystemPrompt,
};

use crate::{
    catalog::{ToolCatalog, ToolExecutor},
    emulate,
    mcp::McpRegistry,
};

#[derive(Debug, Clone)]
pub struct ToolLoopOptions {
    pub max_steps: u32,
    pub emulation: EmulationMode,
    /// Model for tool-use turns; the final answer turn keeps the request's
    /// upstream model.
    pub planner_model: Option<String>,
    /// Requested name → catalog name, merged from settings and request
    /// metadata (request wins).
    pub aliases: HashMap<String, String>,
    pub allow_experimental: bool,
    pub retries: u32,
    pub strict_probe_gate: bool,
    pub mcp_ttl: Duration,
}

impl Default for ToolLoopOptions {
    fn default() -> Self {
        Self {
            max_steps: 4,
            emulation: EmulationMode::Native,
            planner_model: None,
            aliases: HashMap::new(),
            allow_experimental: false,
            retries: 0,
            strict_probe_gate: false,
            mcp_ttl: Duration::from_secs(60),
        }
    }
}

pub struct ToolLoop {
    pub scheduler: Arc<Scheduler>,
    pub catalog: Arc<ToolCatalog>,
    pub mcp: Arc<McpRegistry>,
    pub executor: Option<Arc<dyn ToolExecutor>>,
    pub events: Arc<EventStore>,
}

impl ToolLoop {
    /// Run the loop to completion and return the final canonical response.
    pub async fn run(
        &self,
        mut req: CanonicalRequest,
        route: &[String],
        upstream_model: &str,
        opts: &ToolLoopOptions,
        run_id: &str,
    ) -> Result<CanonicalResponse, GatewayError> {
        let emulating = opts.emulation != EmulationMode::Native;
        let tool_specs = req.tools.clone();
        if emulating {
            // Tools travel in the system prompt, not on the wire.
            if let Some(extra) = emulate::instructions(opts.emulation, &tool_specs) {
                req.system = Some(match req.system.take() {
                    Some(existing) => {
                        SystemPrompt::Text(format!("{}\n\n{extra}", existing.joined_text()))
                    }
                    None => SystemPrompt::Text(extra),
                });
            }
            req.tools.clear();
        }

        let mut turn: u32 = 0;
        let mut last: Option<CanonicalResponse> = None;
        while turn < opts.max_steps {
            let turn_model = opts.planner_model.as_deref().unwrap_or(upstream_model);
            let mut resp = self
                .scheduler
                .complete_with_retries(route, &req, turn_model, opts.retries, opts.strict_probe_gate)
                .await?;

            if emulating && !resp.has_tool_use() {
                if let Some(call) = emulate::parse_call(opts.emulation, &resp.joined_text()) {
                    let id = emulate::emulated_id(turn);
                    self.events.append(
                        NewEvent::run(names::TOOL_EMULATED_CALL, run_id).with_data(json!({
                            "tool": call.name,
                            "id": id,
                            "turn": turn,
                        })),
                    );
                    resp = CanonicalResponse {
                        blocks: vec![AssistantBlock::tool_use(id, call.name, call.input)],
                        stop_reason: StopReason::ToolUse,
                        ..resp
                    };
                }
            }

            if !resp.has_tool_use() {
                // Natural exit. When a planner drove the tool turns, the
                // user-facing answer is synthesised once more with the
                // model the client actually asked for.
                if turn > 0 {
                    if let Some(planner) = &opts.planner_model {
                        if planner != upstream_model {
                            debug!(%planner, final_model = %upstream_model,
                                "re-synthesising final turn with requested model");
                            return self
                                .scheduler
                                .complete_with_retries(
                                    route,
                                    &req,
                                    upstream_model,
                                    opts.retries,
                                    opts.strict_probe_gate,
                                )
                                .await;
                        }
                    }
                }
                return Ok(resp);
            }

            // Tool turn: append the assistant message, execute each call
            // serially in block order, append the results.
            req.messages.push(resp.to_assistant_message());
            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            for (id, name, input) in resp.tool_uses() {
                let (content, is_error) = self.execute_tool(name, input, opts, run_id).await;
                self.events.append(
                    NewEvent::run(names::TOOL_CALL_FINISHED, run_id).with_data(json!({
                        "tool": name,
                        "tool_use_id": id,
                        "is_error": is_error,
                        "turn": turn,
                        "model": turn_model,
                    })),
                );
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: id.to_string(),
                    content: Value::String(content),
                    is_error,
                });
            }
            req.messages.push(Message::user_blocks(result_blocks));
            last = Some(resp);
            turn += 1;
        }

        // Step budget exhausted while the model still wants tools.
        info!(run_id, max_steps = opts.max_steps, "tool loop hit step budget");
        let mut resp = last.expect("max_steps >= 1 guarantees at least one turn");
        resp.stop_reason = StopReason::MaxTurns;
        Ok(resp)
    }

    /// Resolve and execute one tool call: alias → local catalog → MCP
    /// fallback → synthetic error result.
    async fn execute_tool(
        &self,
        requested: &str,
        input: &Value,
        opts: &ToolLoopOptions,
        run_id: &str,
    ) -> (String, bool) {
        let mut name = requested.to_string();
        if let Some(target) = opts.aliases.get(&name) {
            self.events.append(
                NewEvent::run(names::TOOL_ALIAS_APPLIED, run_id)
                    .with_data(json!({ "from": name, "to": target })),
            );
            name = target.clone();
        }

        if self.catalog.executable(&name, opts.allow_experimental) {
            if let Some(executor) = &self.executor {
                return executor.call(&name, input).await;
            }
        }

        if let Some(result) = self.mcp.call_fallback(&name, input, opts.mcp_ttl).await {
            return result;
        }

        if !self.catalog.contains(&name) {
            self.events.append(
                NewEvent::run(names::TOOL_GAP_DETECTED, run_id)
                    .with_data(json!({ "tool": name })),
            );
        }
        (
            format!("no executor available for tool {name:?}"),
            true,
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use vaxel_events::EventFilter;
    use vaxel_route::{HealthRegistry, ScriptedAdapter};
    use vaxel_wire::ToolSpec;

    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn call(&self, name: &str, input: &Value) -> (String, bool) {
            (format!("{name} ran with {input}"), false)
        }
    }

    fn request_with_tool() -> CanonicalRequest {
        CanonicalRequest {
            model: "claude-test".into(),
            messages: vec![Message::user("please use the tool")],
            system: None,
            tools: vec![ToolSpec {
                name: "get_weather".into(),
                description: "weather".into(),
                input_schema: json!({"type": "object"}),
            }],
            max_tokens: 64,
            stream: false,
            metadata: Default::default(),
        }
    }

    fn harness(adapter: Arc<ScriptedAdapter>) -> (ToolLoop, Arc<EventStore>) {
        let (registry, _) = HealthRegistry::new(3, StdDuration::from_secs(60));
        let scheduler = Arc::new(Scheduler::new(registry));
        scheduler.register(adapter);
        let catalog = Arc::new(ToolCatalog::new());
        catalog.upsert(crate::catalog::ToolEntry {
            name: "get_weather".into(),
            description: String::new(),
            status: crate::catalog::ToolStatus::Supported,
        });
        let events = EventStore::shared();
        (
            ToolLoop {
                scheduler,
                catalog,
                mcp: Arc::new(McpRegistry::new()),
                executor: Some(Arc::new(EchoExecutor)),
                events: events.clone(),
            },
            events,
        )
    }

    fn route() -> Vec<String> {
        vec!["scripted".into()]
    }

    #[tokio::test]
    async fn two_turn_loop_feeds_result_back() {
        let adapter = Arc::new(ScriptedAdapter::tool_then_text(
            "scripted",
            "toolu_1",
            "get_weather",
            json!({"city": "Oslo"}),
            "sunny in Oslo",
        ));
        let (tool_loop, _) = harness(adapter.clone());
        let resp = tool_loop
            .run(
                request_with_tool(),
                &route(),
                "claude-test",
                &ToolLoopOptions {
                    max_steps: 3,
                    ..Default::default()
                },
                "run-1",
            )
            .await
            .unwrap();
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.joined_text(), "sunny in Oslo");
        assert_eq!(adapter.call_count(), 2, "exactly two adapter invocations");

        // Turn 2's input must contain the tool_result linked to toolu_1.
        let second_input = adapter.last_request.lock().unwrap().clone().unwrap();
        let has_result = second_input.messages.iter().any(|m| {
            m.content.blocks().iter().any(|b| {
                matches!(b, ContentBlock::ToolResult { tool_use_id, .. }
                    if tool_use_id == "toolu_1")
            })
        });
        assert!(has_result, "tool_result for toolu_1 must be in turn-2 input");
    }

    #[tokio::test]
    async fn max_steps_exhaustion_sets_max_turns() {
        // The adapter keeps asking for tools forever.
        let scripts = (0..5)
            .map(|i| {
                Ok(CanonicalResponse {
                    model: "m".into(),
                    blocks: vec![AssistantBlock::tool_use(
                        format!("toolu_{i}"),
                        "get_weather",
                        json!({}),
                    )],
                    stop_reason: StopReason::ToolUse,
                    usage: Default::default(),
                })
            })
            .collect();
        let adapter = Arc::new(ScriptedAdapter::new("scripted", scripts));
        let (tool_loop, _) = harness(adapter.clone());
        let resp = tool_loop
            .run(
                request_with_tool(),
                &route(),
                "m",
                &ToolLoopOptions {
                    max_steps: 2,
                    ..Default::default()
                },
                "run-1",
            )
            .await
            .unwrap();
        assert_eq!(resp.stop_reason, StopReason::MaxTurns);
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn alias_rewrites_tool_name() {
        let adapter = Arc::new(ScriptedAdapter::tool_then_text(
            "scripted",
            "toolu_1",
            "weather_v1",
            json!({}),
            "done",
        ));
        let (tool_loop, events) = harness(adapter);
        let mut opts = ToolLoopOptions::default();
        opts.aliases
            .insert("weather_v1".into(), "get_weather".into());
        let resp = tool_loop
            .run(request_with_tool(), &route(), "m", &opts, "run-1")
            .await
            .unwrap();
        assert_eq!(resp.joined_text(), "done");
        let aliased = events.list(&EventFilter {
            event_type: Some(names::TOOL_ALIAS_APPLIED.into()),
            ..Default::default()
        });
        assert_eq!(aliased.len(), 1);
        assert_eq!(aliased[0].data["to"], "get_weather");
    }

    #[tokio::test]
    async fn unknown_tool_yields_gap_event_and_error_result() {
        let adapter = Arc::new(ScriptedAdapter::tool_then_text(
            "scripted",
            "toolu_1",
            "nonexistent_tool",
            json!({}),
            "recovered",
        ));
        let (tool_loop, events) = harness(adapter.clone());
        let resp = tool_loop
            .run(
                request_with_tool(),
                &route(),
                "m",
                &ToolLoopOptions::default(),
                "run-1",
            )
            .await
            .unwrap();
        // The loop did not fail; the model saw an error tool_result and
        // answered anyway.
        assert_eq!(resp.joined_text(), "recovered");
        let gaps = events.list(&EventFilter {
            event_type: Some(names::TOOL_GAP_DETECTED.into()),
            ..Default::default()
        });
        assert_eq!(gaps.len(), 1);
        let second_input = adapter.last_request.lock().unwrap().clone().unwrap();
        let error_result = second_input.messages.iter().any(|m| {
            m.content.blocks().iter().any(|b| {
                matches!(b, ContentBlock::ToolResult { is_error: true, .. })
            })
        });
        assert!(error_result);
    }

    #[tokio::test]
    async fn json_emulation_synthesises_tool_use() {
        let scripts = vec![
            Ok(CanonicalResponse {
                model: "m".into(),
                blocks: vec![AssistantBlock::text(
                    r#"{"tool": "get_weather", "input": {"city": "Oslo"}}"#,
                )],
                stop_reason: StopReason::EndTurn,
                usage: Default::default(),
            }),
            Ok(CanonicalResponse {
                model: "m".into(),
                blocks: vec![AssistantBlock::text("emulated done")],
                stop_reason: StopReason::EndTurn,
                usage: Default::default(),
            }),
        ];
        let adapter = Arc::new(ScriptedAdapter::new("scripted", scripts));
        let (tool_loop, events) = harness(adapter.clone());
        let resp = tool_loop
            .run(
                request_with_tool(),
                &route(),
                "m",
                &ToolLoopOptions {
                    emulation: EmulationMode::Json,
                    ..Default::default()
                },
                "run-1",
            )
            .await
            .unwrap();
        assert_eq!(resp.joined_text(), "emulated done");
        let emulated = events.list(&EventFilter {
            event_type: Some(names::TOOL_EMULATED_CALL.into()),
            ..Default::default()
        });
        assert_eq!(emulated.len(), 1);
        assert_eq!(emulated[0].data["id"], "toolu_emu_0");

        // Tools were stripped from the wire and described in the prompt.
        let sent = adapter.last_request.lock().unwrap().clone().unwrap();
        assert!(sent.tools.is_empty());
        assert!(sent
            .system
            .unwrap()
            .joined_text()
            .contains("get_weather"));
        // The synthesised id links the tool_result in the accumulator.
        let linked = sent.messages.iter().any(|m| {
            m.content.blocks().iter().any(|b| {
                matches!(b, ContentBlock::ToolResult { tool_use_id, .. }
                    if tool_use_id == "toolu_emu_0")
            })
        });
        assert!(linked);
    }

    #[tokio::test]
    async fn planner_model_drives_tool_turns_final_uses_requested() {
        let adapter = Arc::new(ScriptedAdapter::tool_then_text(
            "scripted",
            "toolu_1",
            "get_weather",
            json!({}),
            "planner text",
        ));
        let (tool_loop, _) = harness(adapter.clone());
        let resp = tool_loop
            .run(
                request_with_tool(),
                &route(),
                "requested-model",
                &ToolLoopOptions {
                    planner_model: Some("planner-model".into()),
                    ..Default::default()
                },
                "run-1",
            )
            .await
            .unwrap();
        // Three calls: planner tool turn, planner no-tool turn, final
        // synthesis with the requested model.
        let models = adapter.models_seen.lock().unwrap().clone();
        assert_eq!(
            models,
            vec!["planner-model", "planner-model", "requested-model"]
        );
        assert_eq!(resp.joined_text(), "[no more scripts]");
    }

    #[tokio::test]
    async fn mcp_fallback_handles_uncatalogued_tool() {
        use crate::mcp::{McpCallError, McpServer, McpToolInfo};

        struct WeatherMcp;
        #[async_trait]
        impl McpServer for WeatherMcp {
            fn name(&self) -> &str {
                "weather-mcp"
            }
            async fn health(&self) -> bool {
                true
            }
            async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpCallError> {
                Ok(vec![McpToolInfo {
                    name: "remote_weather".into(),
                    description: String::new(),
                }])
            }
            async fn call_tool(
                &self,
                _name: &str,
                _args: &Value,
            ) -> Result<(String, bool), McpCallError> {
                Ok(("remote says sunny".into(), false))
            }
        }

        let adapter = Arc::new(ScriptedAdapter::tool_then_text(
            "scripted",
            "toolu_1",
            "remote_weather",
            json!({}),
            "ok",
        ));
        let (tool_loop, events) = harness(adapter.clone());
        tool_loop.mcp.register(Arc::new(WeatherMcp));
        let resp = tool_loop
            .run(
                request_with_tool(),
                &route(),
                "m",
                &ToolLoopOptions::default(),
                "run-1",
            )
            .await
            .unwrap();
        assert_eq!(resp.joined_text(), "ok");
        // The MCP server handled it, so no gap was detected.
        let gaps = events.list(&EventFilter {
            event_type: Some(names::TOOL_GAP_DETECTED.into()),
            ..Default::default()
        });
        assert!(gaps.is_empty());
        let sent = adapter.last_request.lock().unwrap().clone().unwrap();
        let saw_remote_result = sent.messages.iter().any(|m| {
            m.content.blocks().iter().any(|b| {
                matches!(b, ContentBlock::ToolResult { content, .. }
                    if content.as_str() == Some("remote says sunny"))
            })
        });
        assert!(saw_remote_result);
    }
}
