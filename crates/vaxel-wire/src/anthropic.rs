// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Anthropic `/v1/messages` dialect: decode to canonical, encode from
//! canonical, and the SSE envelope used for both pass-through and
//! synthesised streams.
//!
//! The block vocabulary maps 1:1 (`tool_use`/`tool_result` are native), so
//! this translator is mostly shape-shuffling: the top-level `system` field,
//! image `source` objects, and the stop-reason rename (`max_tokens` ↔
//! `length`).

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    canonical::{
        CanonicalRequest, CanonicalResponse, ContentBlock, Message, MessageContent,
        RequestMetadata, Role, StopReason, SystemPrompt, ToolSpec, DEFAULT_MAX_TOKENS,
    },
    error::GatewayError,
    stream::{rewrite_model_field, sse_frame, BlockDelta, StreamEvent},
};

/// Split a `data:<mime>;base64,<b64>` URL into `(mime, b64)`. Errors let
/// callers fall back to treating the string as a plain HTTPS URL.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

// ─── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(default)]
    system: Option<Value>,
    #[serde(default)]
    tools: Vec<WireTool>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    tool_choice: Option<Value>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct WireTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
}

// ─── Decode ───────────────────────────────────────────────────────────────────

/// Decode an Anthropic messages request body into the canonical shape.
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

    let system = match wire.system {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(SystemPrompt::Text(s)),
        Some(Value::Array(items)) => {
            let blocks = items
                .iter()
                .map(decode_block)
                .collect::<Result<Vec<_>, _>>()?;
            Some(SystemPrompt::Blocks(blocks))
        }
        Some(other) => {
            return Err(GatewayError::InvalidRequest(format!(
                "system must be a string or array, got {other}"
            )))
        }
    };

    let messages = wire
        .messages
        .into_iter()
        .map(decode_message)
        .collect::<Result<Vec<_>, _>>()?;

    let req = CanonicalRequest {
        model: wire.model,
        messages,
        system,
        tools: wire
            .tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect(),
        max_tokens: wire.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stream: wire.stream,
        metadata,
    };
    req.validate()?;
    Ok(req)
}

fn decode_message(wire: WireMessage) -> Result<Message, GatewayError> {
    let role = match wire.role.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "system" => Role::System,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "unknown message role {other:?}"
            )))
        }
    };
    let content = match wire.content {
        Value::String(s) => MessageContent::Text(s),
        Value::Array(items) => MessageContent::Blocks(
            items
                .iter()
                .map(decode_block)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "message content must be string or array, got {other}"
            )))
        }
    };
    Ok(Message { role, content })
}

fn decode_block(v: &Value) -> Result<ContentBlock, GatewayError> {
    match v["type"].as_str() {
        Some("text") => Ok(ContentBlock::text(v["text"].as_str().unwrap_or_default())),
        Some("image") => {
            let source = &v["source"];
            let url = match source["type"].as_str() {
                Some("base64") => {
                    let mime = source["media_type"].as_str().unwrap_or("image/png");
                    let data = source["data"].as_str().unwrap_or_default();
                    format!("data:{mime};base64,{data}")
                }
                Some("url") => source["url"].as_str().unwrap_or_default().to_string(),
                _ => {
                    return Err(GatewayError::InvalidRequest(
                        "image source must be base64 or url".into(),
                    ))
                }
            };
            Ok(ContentBlock::image(url))
        }
        Some("tool_use") => Ok(ContentBlock::ToolUse {
            id: v["id"].as_str().unwrap_or_default().to_string(),
            name: v["name"].as_str().unwrap_or_default().to_string(),
            input: v.get("input").cloned().unwrap_or_else(|| json!({})),
        }),
        Some("tool_result") => Ok(ContentBlock::ToolResult {
            tool_use_id: v["tool_use_id"].as_str().unwrap_or_default().to_string(),
            content: v.get("content").cloned().unwrap_or(Value::String(String::new())),
            is_error: v["is_error"].as_bool().unwrap_or(false),
        }),
        other => Err(GatewayError::InvalidRequest(format!(
            "unknown content block type {other:?}"
        ))),
    }
}

// ─── Encode ───────────────────────────────────────────────────────────────────

fn stop_reason_str(r: StopReason) -> &'static str {
    match r {
        StopReason::EndTurn => "end_turn",
        StopReason::ToolUse => "tool_use",
        StopReason::MaxTurns => "max_turns",
        StopReason::StopSequence => "stop_sequence",
        StopReason::Length => "max_tokens",
    }
}

fn encode_block(b: &ContentBlock) -> Value {
    match b {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::ImageUrl { image_url } => {
            if let Ok((mime, data)) = parse_data_url_parts(image_url) {
                json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": mime, "data": data }
                })
            } else {
                json!({
                    "type": "image",
                    "source": { "type": "url", "url": image_url }
                })
            }
        }
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": input
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut obj = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                obj["is_error"] = json!(true);
            }
            obj
        }
    }
}

/// Build the Anthropic wire body for a canonical request, used both by the
/// upstream adapter and by round-trip tests.
pub fn build_request_body(req: &CanonicalRequest, upstream_model: &str) -> Value {
    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User | Role::System => "user",
                Role::Assistant => "assistant",
            };
            let content = match &m.content {
                MessageContent::Text(t) => json!(t),
                MessageContent::Blocks(blocks) => {
                    json!(blocks.iter().map(encode_block).collect::<Vec<_>>())
                }
            };
            json!({ "role": role, "content": content })
        })
        .collect();

    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": req.stream,
    });
    match &req.system {
        Some(SystemPrompt::Text(t)) => body["system"] = json!(t),
        Some(SystemPrompt::Blocks(blocks)) => {
            body["system"] = json!(blocks.iter().map(encode_block).collect::<Vec<_>>())
        }
        None => {}
    }
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
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

/// Encode a canonical response as an Anthropic `message` object, naming the
/// client's requested model.
pub fn encode_response(
    resp: &CanonicalResponse,
    client_model: &str,
    message_id: &str,
) -> Value {
    let content: Vec<Value> = resp
        .blocks
        .iter()
        .map(|b| match b {
            crate::canonical::AssistantBlock::Text { text } => {
                json!({ "type": "text", "text": text })
            }
            crate::canonical::AssistantBlock::ToolUse { id, name, input } => {
                json!({ "type": "tool_use", "id": id, "name": name, "input": input })
            }
        })
        .collect();
    json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "model": client_model,
        "content": content,
        "stop_reason": stop_reason_str(resp.stop_reason),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": resp.usage.input_tokens,
            "output_tokens": resp.usage.output_tokens,
        }
    })
}

/// Decode an Anthropic `message` response object back into canonical form
/// (used by the Anthropic upstream adapter).
pub fn decode_response(v: &Value) -> Result<CanonicalResponse, GatewayError> {
    let blocks = v["content"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|b| match b["type"].as_str() {
                    Some("text") => Some(crate::canonical::AssistantBlock::text(
                        b["text"].as_str().unwrap_or_default(),
                    )),
                    Some("tool_use") => Some(crate::canonical::AssistantBlock::tool_use(
                        b["id"].as_str().unwrap_or_default(),
                        b["name"].as_str().unwrap_or_default(),
                        b.get("input").cloned().unwrap_or_else(|| json!({})),
                    )),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let stop_reason = match v["stop_reason"].as_str() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::Length,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    };
    Ok(CanonicalResponse {
        model: v["model"].as_str().unwrap_or_default().to_string(),
        blocks,
        stop_reason,
        usage: crate::canonical::Usage {
            input_tokens: v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        },
    })
}

// ─── Streaming ────────────────────────────────────────────────────────────────

/// Encode one stream event as Anthropic SSE frames.
///
/// Pass-through payloads are forwarded byte-accurately except that
/// `message_start` payloads get the model field rewritten to the client's
/// requested model.
pub fn encode_stream_event(
    ev: &StreamEvent,
    client_model: &str,
    message_id: &str,
) -> Option<String> {
    match ev {
        StreamEvent::MessageStart { usage, .. } => Some(sse_frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": client_model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": {
                        "input_tokens": usage.input_tokens,
                        "output_tokens": usage.output_tokens,
                    }
                }
            }),
        )),
        StreamEvent::ContentBlockStart { index, block } => Some(sse_frame(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": block,
            }),
        )),
        StreamEvent::ContentBlockDelta { index, delta } => {
            let delta_json = match delta {
                BlockDelta::TextDelta { text } => {
                    json!({ "type": "text_delta", "text": text })
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    json!({ "type": "input_json_delta", "partial_json": partial_json })
                }
            };
            Some(sse_frame(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": delta_json,
                }),
            ))
        }
        StreamEvent::ContentBlockStop { index } => Some(sse_frame(
            "content_block_stop",
            &json!({ "type": "content_block_stop", "index": index }),
        )),
        StreamEvent::MessageDelta { stop_reason, usage } => {
            let mut payload = json!({
                "type": "message_delta",
                "delta": {},
            });
            if let Some(r) = stop_reason {
                payload["delta"]["stop_reason"] = json!(stop_reason_str(*r));
            }
            if let Some(u) = usage {
                payload["usage"] = json!({ "output_tokens": u.output_tokens });
            }
            Some(sse_frame("message_delta", &payload))
        }
        StreamEvent::MessageStop => Some(sse_frame(
            "message_stop",
            &json!({ "type": "message_stop" }),
        )),
        StreamEvent::Passthrough { event, raw } => {
            let raw = if event.as_deref() == Some("message_start") {
                rewrite_model_field(raw, &["message", "model"], client_model)
            } else {
                raw.clone()
            };
            let data = String::from_utf8_lossy(&raw);
            match event {
                Some(name) => Some(format!("event: {name}\ndata: {data}\n\n")),
                None => Some(format!("data: {data}\n\n")),
            }
        }
    }
}

/// Synthesise the full SSE envelope for a finished canonical response. Used
/// by the server-side tool loop when the outer request is streaming: only
/// the final turn is streamed, wrapped as if the upstream produced it.
pub fn synthesize_stream(
    resp: &CanonicalResponse,
    client_model: &str,
    message_id: &str,
) -> Vec<String> {
    let mut frames = Vec::new();
    frames.push(
        encode_stream_event(
            &StreamEvent::MessageStart {
                model: resp.model.clone(),
                usage: crate::canonical::Usage {
                    input_tokens: resp.usage.input_tokens,
                    output_tokens: 0,
                },
            },
            client_model,
            message_id,
        )
        .expect("message_start frame"),
    );
    for (i, block) in resp.blocks.iter().enumerate() {
        let index = i as u32;
        match block {
            crate::canonical::AssistantBlock::Text { text } => {
                frames.extend([
                    encode_stream_event(
                        &StreamEvent::ContentBlockStart {
                            index,
                            block: json!({ "type": "text", "text": "" }),
                        },
                        client_model,
                        message_id,
                    )
                    .expect("frame"),
                    encode_stream_event(
                        &StreamEvent::ContentBlockDelta {
                            index,
                            delta: BlockDelta::TextDelta { text: text.clone() },
                        },
                        client_model,
                        message_id,
                    )
                    .expect("frame"),
                ]);
            }
            crate::canonical::AssistantBlock::ToolUse { id, name, input } => {
                frames.extend([
                    encode_stream_event(
                        &StreamEvent::ContentBlockStart {
                            index,
                            block: json!({
                                "type": "tool_use", "id": id, "name": name, "input": {}
                            }),
                        },
                        client_model,
                        message_id,
                    )
                    .expect("frame"),
                    encode_stream_event(
                        &StreamEvent::ContentBlockDelta {
                            index,
                            delta: BlockDelta::InputJsonDelta {
                                partial_json: input.to_string(),
                            },
                        },
                        client_model,
                        message_id,
                    )
                    .expect("frame"),
                ]);
            }
        }
        frames.push(
            encode_stream_event(
                &StreamEvent::ContentBlockStop { index },
                client_model,
                message_id,
            )
            .expect("frame"),
        );
    }
    frames.push(
        encode_stream_event(
            &StreamEvent::MessageDelta {
                stop_reason: Some(resp.stop_reason),
                usage: Some(resp.usage),
            },
            client_model,
            message_id,
        )
        .expect("frame"),
    );
    frames.push(
        encode_stream_event(&StreamEvent::MessageStop, client_model, message_id)
            .expect("frame"),
    );
    frames
}

/// Terminal frames for a stream that fails after `message_start`: a clean
/// `message_delta{stop_reason:"error"}` + `message_stop` instead of a
/// mid-stream HTTP error.
pub fn error_trailer() -> Vec<String> {
    vec![
        sse_frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": { "stop_reason": "error" },
            }),
        ),
        sse_frame("message_stop", &json!({ "type": "message_stop" })),
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
