// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! OpenAI `/v1/chat/completions` dialect.
//!
//! The interesting asymmetry: OpenAI splits tool traffic across message
//! roles (`assistant.tool_calls` out, `role=tool` back in) while the
//! canonical model keeps everything as content blocks. Decoding folds
//! `tool_calls` into `tool_use` blocks and `role=tool` messages into user
//! messages holding a `tool_result`; encoding unfolds them again. The
//! outward finish reason is `tool_calls` iff the canonical response ends
//! with a `tool_use` block.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    canonical::{
        AssistantBlock, CanonicalRequest, CanonicalResponse, ContentBlock, Message,
        MessageContent, RequestMetadata, Role, StopReason, SystemPrompt, ToolSpec, Usage,
        DEFAULT_MAX_TOKENS,
    },
    error::GatewayError,
    stream::{sse_data, StreamEvent},
};

// ─── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    tool_choice: Option<Value>,
    #[serde(default)]
    max_tokens: Option<u32>,
    /// Newer alias; wins over `max_tokens` when both are present.
    #[serde(default)]
    max_completion_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(default)]
    function: WireFunction,
}

#[derive(Debug, Default, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: String,
    /// JSON-encoded argument object.
    #[serde(default)]
    arguments: String,
}

// ─── Decode ───────────────────────────────────────────────────────────────────

/// Decode an OpenAI chat.completions request body into the canonical shape.
pub fn decode_request(body: &[u8]) -> Result<CanonicalRequest, GatewayError> {
    let wire: WireRequest = crate::from_json_strict_single(body)?;

    let mut metadata = wire
        .metadata
        .as_ref()
        .map(RequestMetadata::from_map)
        .unwrap_or_default();
    if let Some(tc) = wire.tool_choice {
        metadata.tool_choice = Some(tc);
    }
    if metadata.temperature.is_none() {
        metadata.temperature = wire.temperature;
    }
    if metadata.top_p.is_none() {
        metadata.top_p = wire.top_p;
    }

    let mut system: Option<SystemPrompt> = None;
    let mut messages: Vec<Message> = Vec::new();

    for m in wire.messages {
        match m.role.as_str() {
            "system" | "developer" => {
                let text = content_text(m.content.as_ref());
                system = Some(match system.take() {
                    None => SystemPrompt::Text(text),
                    Some(prev) => {
                        SystemPrompt::Text(format!("{}\n{}", prev.joined_text(), text))
                    }
                });
            }
            "user" => messages.push(Message {
                role: Role::User,
                content: decode_user_content(m.content.as_ref())?,
            }),
            "assistant" => {
                let mut blocks: Vec<ContentBlock> = Vec::new();
                let text = content_text(m.content.as_ref());
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text));
                }
                for call in &m.tool_calls {
                    let input: Value = if call.function.arguments.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&call.function.arguments).map_err(|e| {
                            GatewayError::InvalidRequest(format!(
                                "tool call {} has non-JSON arguments: {e}",
                                call.id
                            ))
                        })?
                    };
                    blocks.push(ContentBlock::tool_use(
                        call.id.clone(),
                        call.function.name.clone(),
                        input,
                    ));
                }
                if blocks.is_empty() {
                    messages.push(Message::assistant(""));
                } else if blocks.len() == 1
                    && matches!(blocks[0], ContentBlock::Text { .. })
                {
                    messages.push(Message::assistant(content_text(m.content.as_ref())));
                } else {
                    messages.push(Message::assistant_blocks(blocks));
                }
            }
            "tool" => {
                let id = m.tool_call_id.ok_or_else(|| {
                    GatewayError::InvalidRequest(
                        "role=tool message requires tool_call_id".into(),
                    )
                })?;
                let content = m.content.unwrap_or(Value::String(String::new()));
                messages.push(Message::user_blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: id,
                    content,
                    is_error: false,
                }]));
            }
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown message role {other:?}"
                )))
            }
        }
    }

    let tools = wire
        .tools
        .iter()
        .map(decode_tool)
        .collect::<Result<Vec<_>, _>>()?;

    let req = CanonicalRequest {
        model: wire.model,
        messages,
        system,
        tools,
        max_tokens: wire
            .max_completion_tokens
            .or(wire.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        stream: wire.stream,
        metadata,
    };
    req.validate()?;
    Ok(req)
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| match p["type"].as_str() {
                Some("text") => p["text"].as_str().map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn decode_user_content(content: Option<&Value>) -> Result<MessageContent, GatewayError> {
    match content {
        Some(Value::String(s)) => Ok(MessageContent::Text(s.clone())),
        Some(Value::Array(parts)) => {
            let blocks = parts
                .iter()
                .map(|p| match p["type"].as_str() {
                    Some("text") => Ok(ContentBlock::text(p["text"].as_str().unwrap_or_default())),
                    Some("image_url") => {
                        let url = p["image_url"]["url"]
                            .as_str()
                            .or_else(|| p["image_url"].as_str())
                            .unwrap_or_default();
                        Ok(ContentBlock::image(url))
                    }
                    other => Err(GatewayError::InvalidRequest(format!(
                        "unknown content part type {other:?}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            // Collapse a lone text part so array and string forms compare
            // equal after a round trip.
            if blocks.len() == 1 {
                if let ContentBlock::Text { text } = &blocks[0] {
                    return Ok(MessageContent::Text(text.clone()));
                }
            }
            Ok(MessageContent::Blocks(blocks))
        }
        _ => Ok(MessageContent::Text(String::new())),
    }
}

fn decode_tool(v: &Value) -> Result<ToolSpec, GatewayError> {
    let function = match v["type"].as_str() {
        Some("function") | None => &v["function"],
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported tool type {other:?}"
            )))
        }
    };
    let name = function["name"].as_str().ok_or_else(|| {
        GatewayError::InvalidRequest("tool function requires a name".into())
    })?;
    Ok(ToolSpec {
        name: name.to_string(),
        description: function["description"].as_str().unwrap_or_default().to_string(),
        input_schema: function
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
    })
}

// ─── Encode ───────────────────────────────────────────────────────────────────

fn finish_reason(resp: &CanonicalResponse) -> &'static str {
    if resp.ends_with_tool_use() {
        "tool_calls"
    } else if resp.stop_reason == StopReason::Length {
        "length"
    } else {
        "stop"
    }
}

/// Build the OpenAI wire body for a canonical request, used both by the
/// upstream adapter and by round-trip tests.
pub fn build_request_body(req: &CanonicalRequest, upstream_model: &str) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = &req.system {
        messages.push(json!({ "role": "system", "content": system.joined_text() }));
    }
    for m in &req.messages {
        match (&m.role, &m.content) {
            (Role::System, content) => {
                messages.push(json!({ "role": "system", "content": content.joined_text() }));
            }
            (Role::User, MessageContent::Text(t)) => {
                messages.push(json!({ "role": "user", "content": t }));
            }
            (Role::User, MessageContent::Blocks(blocks)) => {
                encode_user_blocks(blocks, &mut messages);
            }
            (Role::Assistant, MessageContent::Text(t)) => {
                messages.push(json!({ "role": "assistant", "content": t }));
            }
            (Role::Assistant, MessageContent::Blocks(blocks)) => {
                messages.push(encode_assistant_blocks(blocks));
            }
        }
    }

    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": req.stream,
    });
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            }))
            .collect::<Vec<_>>());
    }
    if let Some(tc) = &req.metadata.tool_choice {
        body["tool_choice"] = tc.clone();
    }
    if let Some(t) = req.metadata.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.metadata.top_p {
        body["top_p"] = json!(p);
    }
    body
}

/// A user message may mix `tool_result` blocks (which OpenAI wants as
/// separate `role=tool` messages) with ordinary content. Tool results are
/// emitted first, in block order, then the remaining content as one user
/// message.
fn encode_user_blocks(blocks: &[ContentBlock], out: &mut Vec<Value>) {
    let mut parts: Vec<Value> = Vec::new();
    for b in blocks {
        match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let text = match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": text,
                }));
            }
            ContentBlock::Text { text } => parts.push(json!({ "type": "text", "text": text })),
            ContentBlock::ImageUrl { image_url } => parts.push(json!({
                "type": "image_url",
                "image_url": { "url": image_url }
            })),
            // tool_use never appears in user content
            ContentBlock::ToolUse { .. } => {}
        }
    }
    if parts.len() == 1 && parts[0]["type"] == "text" {
        out.push(json!({ "role": "user", "content": parts[0]["text"] }));
    } else if !parts.is_empty() {
        out.push(json!({ "role": "user", "content": parts }));
    }
}

fn encode_assistant_blocks(blocks: &[ContentBlock]) -> Value {
    let text: Vec<&str> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": input.to_string() }
            })),
            _ => None,
        })
        .collect();
    let mut msg = json!({ "role": "assistant" });
    msg["content"] = if text.is_empty() {
        Value::Null
    } else {
        json!(text.join("\n"))
    };
    if !tool_calls.is_empty() {
        msg["tool_calls"] = json!(tool_calls);
    }
    msg
}

/// Encode a canonical response as a `chat.completion` object.
pub fn encode_response(
    resp: &CanonicalResponse,
    client_model: &str,
    id: &str,
    created: i64,
) -> Value {
    let blocks: Vec<ContentBlock> = resp
        .blocks
        .iter()
        .map(|b| match b {
            AssistantBlock::Text { text } => ContentBlock::text(text.clone()),
            AssistantBlock::ToolUse { id, name, input } => {
                ContentBlock::tool_use(id.clone(), name.clone(), input.clone())
            }
        })
        .collect();
    let message = encode_assistant_blocks(&blocks);
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": client_model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason(resp),
        }],
        "usage": {
            "prompt_tokens": resp.usage.input_tokens,
            "completion_tokens": resp.usage.output_tokens,
            "total_tokens": resp.usage.total(),
        }
    })
}

/// Decode an OpenAI `chat.completion` response object into canonical form
/// (used by the OpenAI upstream adapter).
pub fn decode_response(v: &Value) -> Result<CanonicalResponse, GatewayError> {
    let choice = &v["choices"][0];
    let message = &choice["message"];
    let mut blocks: Vec<AssistantBlock> = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            blocks.push(AssistantBlock::text(text));
        }
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let args = call["function"]["arguments"].as_str().unwrap_or("{}");
            let input: Value = serde_json::from_str(args).unwrap_or_else(|_| json!({}));
            blocks.push(AssistantBlock::tool_use(
                call["id"].as_str().unwrap_or_default(),
                call["function"]["name"].as_str().unwrap_or_default(),
                input,
            ));
        }
    }
    let stop_reason = match choice["finish_reason"].as_str() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::Length,
        _ => StopReason::EndTurn,
    };
    Ok(CanonicalResponse {
        model: v["model"].as_str().unwrap_or_default().to_string(),
        blocks,
        stop_reason,
        usage: Usage {
            input_tokens: v["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: v["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        },
    })
}

// ─── Streaming ────────────────────────────────────────────────────────────────

fn chunk(id: &str, model: &str, created: i64, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }]
    })
}

/// Encode one stream event as chat.completions SSE frames. Returns `None`
/// for events with no chunk representation (block boundaries).
pub fn encode_stream_event(
    ev: &StreamEvent,
    client_model: &str,
    id: &str,
    created: i64,
) -> Option<String> {
    match ev {
        StreamEvent::MessageStart { .. } => Some(sse_data(&chunk(
            id,
            client_model,
            created,
            json!({ "role": "assistant", "content": "" }),
            None,
        ))),
        StreamEvent::ContentBlockDelta { delta, .. } => match delta {
            crate::stream::BlockDelta::TextDelta { text } => Some(sse_data(&chunk(
                id,
                client_model,
                created,
                json!({ "content": text }),
                None,
            ))),
            crate::stream::BlockDelta::InputJsonDelta { .. } => None,
        },
        StreamEvent::ContentBlockStart { .. } | StreamEvent::ContentBlockStop { .. } => None,
        StreamEvent::MessageDelta { stop_reason, .. } => {
            let finish = match stop_reason {
                Some(StopReason::ToolUse) => "tool_calls",
                Some(StopReason::Length) => "length",
                _ => "stop",
            };
            Some(sse_data(&chunk(
                id,
                client_model,
                created,
                json!({}),
                Some(finish),
            )))
        }
        StreamEvent::MessageStop => Some(crate::stream::SSE_DONE.to_string()),
        StreamEvent::Passthrough { raw, .. } => {
            let raw = crate::stream::rewrite_model_field(raw, &["model"], client_model);
            Some(format!("data: {}\n\n", String::from_utf8_lossy(&raw)))
        }
    }
}

/// Synthesise the full chunk stream for a finished canonical response,
/// ending with `data: [DONE]`.
pub fn synthesize_stream(
    resp: &CanonicalResponse,
    client_model: &str,
    id: &str,
    created: i64,
) -> Vec<String> {
    let mut frames = vec![sse_data(&chunk(
        id,
        client_model,
        created,
        json!({ "role": "assistant", "content": "" }),
        None,
    ))];
    for block in &resp.blocks {
        match block {
            AssistantBlock::Text { text } => frames.push(sse_data(&chunk(
                id,
                client_model,
                created,
                json!({ "content": text }),
                None,
            ))),
            AssistantBlock::ToolUse {
                id: call_id,
                name,
                input,
            } => frames.push(sse_data(&chunk(
                id,
                client_model,
                created,
                json!({
                    "tool_calls": [{
                        "index": 0,
                        "id": call_id,
                        "type": "function",
                        "function": { "name": name, "arguments": input.to_string() }
                    }]
                }),
                None,
            ))),
        }
    }
    frames.push(sse_data(&chunk(
        id,
        client_model,
        created,
        json!({}),
        Some(finish_reason(resp)),
    )));
    frames.push(crate::stream::SSE_DONE.to_string());
    frames
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
