// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! OpenAI `/v1/responses` dialect.
//!
//! Input comes either as a flat string or as an item array whose
//! `function_call` / `function_call_output` items are the exact analogue of
//! canonical `tool_use` / `tool_result` blocks — that pair is an
//! isomorphism. Streaming emits `response.*` events and terminates with
//! `data: [DONE]`.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    canonical::{
        AssistantBlock, CanonicalRequest, CanonicalResponse, ContentBlock, Message,
        MessageContent, RequestMetadata, Role, StopReason, SystemPrompt, ToolSpec,
        DEFAULT_MAX_TOKENS,
    },
    error::GatewayError,
    stream::{sse_frame, SSE_DONE},
};

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    input: Value,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default)]
    tool_choice: Option<Value>,
    #[serde(default)]
    max_output_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, Value>>,
}

// ─── Decode ───────────────────────────────────────────────────────────────────

/// Decode a `/v1/responses` request body into the canonical shape.
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

    let messages = match &wire.input {
        Value::String(s) => vec![Message::user(s.clone())],
        Value::Array(items) => decode_items(items)?,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "input must be a string or array, got {other}"
            )))
        }
    };

    let tools = wire
        .tools
        .iter()
        .map(decode_tool)
        .collect::<Result<Vec<_>, _>>()?;

    let req = CanonicalRequest {
        model: wire.model,
        messages,
        system: wire.instructions.map(SystemPrompt::Text),
        tools,
        max_tokens: wire.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stream: wire.stream,
        metadata,
    };
    req.validate()?;
    Ok(req)
}

fn decode_items(items: &[Value]) -> Result<Vec<Message>, GatewayError> {
    let mut messages = Vec::new();
    for item in items {
        // Bare `{role, content}` objects are accepted as message items.
        let item_type = item["type"].as_str().unwrap_or("message");
        match item_type {
            "message" => {
                let role = match item["role"].as_str() {
                    Some("user") | None => Role::User,
                    Some("assistant") => Role::Assistant,
                    Some("system") | Some("developer") => Role::System,
                    Some(other) => {
                        return Err(GatewayError::InvalidRequest(format!(
                            "unknown input role {other:?}"
                        )))
                    }
                };
                messages.push(Message {
                    role,
                    content: decode_item_content(&item["content"])?,
                });
            }
            "function_call" => {
                let args = item["arguments"].as_str().unwrap_or("{}");
                let input: Value =
                    serde_json::from_str(args).unwrap_or_else(|_| json!({}));
                messages.push(Message::assistant_blocks(vec![ContentBlock::tool_use(
                    item["call_id"].as_str().unwrap_or_default(),
                    item["name"].as_str().unwrap_or_default(),
                    input,
                )]));
            }
            "function_call_output" => {
                let call_id = item["call_id"].as_str().ok_or_else(|| {
                    GatewayError::InvalidRequest(
                        "function_call_output requires call_id".into(),
                    )
                })?;
                messages.push(Message::user_blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: call_id.to_string(),
                    content: item
                        .get("output")
                        .cloned()
                        .unwrap_or(Value::String(String::new())),
                    is_error: false,
                }]));
            }
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown input item type {other:?}"
                )))
            }
        }
    }
    Ok(messages)
}

fn decode_item_content(content: &Value) -> Result<MessageContent, GatewayError> {
    match content {
        Value::String(s) => Ok(MessageContent::Text(s.clone())),
        Value::Array(parts) => {
            let blocks = parts
                .iter()
                .map(|p| match p["type"].as_str() {
                    Some("input_text") | Some("output_text") | Some("text") => {
                        Ok(ContentBlock::text(p["text"].as_str().unwrap_or_default()))
                    }
                    Some("input_image") => Ok(ContentBlock::image(
                        p["image_url"].as_str().unwrap_or_default(),
                    )),
                    other => Err(GatewayError::InvalidRequest(format!(
                        "unknown input content type {other:?}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            // Collapse a lone text part for cleaner equality with the flat
            // string form.
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
    // Responses flattens the function definition onto the tool object.
    let name = v["name"]
        .as_str()
        .or_else(|| v["function"]["name"].as_str())
        .ok_or_else(|| GatewayError::InvalidRequest("tool requires a name".into()))?;
    Ok(ToolSpec {
        name: name.to_string(),
        description: v["description"].as_str().unwrap_or_default().to_string(),
        input_schema: v
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
    })
}

// ─── Encode ───────────────────────────────────────────────────────────────────

/// Reconstruct the input item array for a canonical request. The inverse of
/// [`decode_request`] over the item vocabulary, used by round-trip tests.
pub fn build_input_items(req: &CanonicalRequest) -> Vec<Value> {
    let mut items = Vec::new();
    for m in &req.messages {
        let mut plain: Vec<Value> = Vec::new();
        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        for block in m.content.blocks() {
            match block {
                ContentBlock::ToolUse { id, name, input } => items.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": input.to_string(),
                })),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => items.push(json!({
                    "type": "function_call_output",
                    "call_id": tool_use_id,
                    "output": content,
                })),
                ContentBlock::Text { text } => {
                    let part_type = if m.role == Role::Assistant {
                        "output_text"
                    } else {
                        "input_text"
                    };
                    plain.push(json!({ "type": part_type, "text": text }));
                }
                ContentBlock::ImageUrl { image_url } => {
                    plain.push(json!({ "type": "input_image", "image_url": image_url }))
                }
            }
        }
        if !plain.is_empty() {
            items.push(json!({ "type": "message", "role": role, "content": plain }));
        }
    }
    items
}

fn output_items(resp: &CanonicalResponse, id_prefix: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let text = resp.joined_text();
    if !text.is_empty() {
        out.push(json!({
            "type": "message",
            "id": format!("{id_prefix}_msg"),
            "role": "assistant",
            "status": "completed",
            "content": [{ "type": "output_text", "text": text }],
        }));
    }
    for (i, (call_id, name, input)) in resp.tool_uses().iter().enumerate() {
        out.push(json!({
            "type": "function_call",
            "id": format!("{id_prefix}_fc{i}"),
            "call_id": call_id,
            "name": name,
            "arguments": input.to_string(),
            "status": "completed",
        }));
    }
    out
}

/// Encode a canonical response as a `response` object.
pub fn encode_response(
    resp: &CanonicalResponse,
    client_model: &str,
    id: &str,
    created: i64,
) -> Value {
    json!({
        "id": id,
        "object": "response",
        "created_at": created,
        "status": "completed",
        "model": client_model,
        "output": output_items(resp, id),
        "usage": {
            "input_tokens": resp.usage.input_tokens,
            "output_tokens": resp.usage.output_tokens,
            "total_tokens": resp.usage.total(),
        }
    })
}

// ─── Streaming ────────────────────────────────────────────────────────────────

/// Synthesise the `response.*` SSE stream for a finished canonical
/// response: `response.created`, one `response.output_item.added` per item,
/// text deltas, `response.completed`, `data: [DONE]`.
pub fn synthesize_stream(
    resp: &CanonicalResponse,
    client_model: &str,
    id: &str,
    created: i64,
) -> Vec<String> {
    let mut frames = Vec::new();
    frames.push(sse_frame(
        "response.created",
        &json!({
            "type": "response.created",
            "response": {
                "id": id,
                "object": "response",
                "created_at": created,
                "status": "in_progress",
                "model": client_model,
                "output": [],
            }
        }),
    ));
    for (i, item) in output_items(resp, id).iter().enumerate() {
        frames.push(sse_frame(
            "response.output_item.added",
            &json!({
                "type": "response.output_item.added",
                "output_index": i,
                "item": item,
            }),
        ));
        if item["type"] == "message" {
            let text = item["content"][0]["text"].as_str().unwrap_or_default();
            frames.push(sse_frame(
                "response.output_text.delta",
                &json!({
                    "type": "response.output_text.delta",
                    "output_index": i,
                    "delta": text,
                }),
            ));
        }
    }
    frames.push(sse_frame(
        "response.completed",
        &json!({
            "type": "response.completed",
            "response": encode_response(resp, client_model, id, created),
        }),
    ));
    frames.push(SSE_DONE.to_string());
    frames
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(s: &str) -> CanonicalRequest {
        decode_request(s.as_bytes()).expect("decode")
    }

    #[test]
    fn decode_flat_string_input() {
        let req = decode(r#"{"model":"gpt-test","input":"hello"}"#);
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].as_text(), Some("hello"));
        assert_eq!(req.messages[0].role, Role::User);
    }

    #[test]
    fn decode_instructions_become_system() {
        let req = decode(r#"{"model":"m","input":"x","instructions":"be brief"}"#);
        assert_eq!(req.system.as_ref().unwrap().joined_text(), "be brief");
    }

    #[test]
    fn decode_function_call_pair() {
        let req = decode(
            r#"{"model":"m","input":[
                {"type":"message","role":"user","content":"use the tool"},
                {"type":"function_call","call_id":"fc_1","name":"get_weather",
                 "arguments":"{\"city\":\"Oslo\"}"},
                {"type":"function_call_output","call_id":"fc_1","output":"rain"}]}"#,
        );
        assert!(req.messages[1].has_tool_use());
        let blocks = req.messages[2].content.blocks();
        assert!(matches!(&blocks[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "fc_1"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn decode_output_without_call_id_rejected() {
        let err = decode_request(
            br#"{"model":"m","input":[
                {"type":"function_call_output","output":"rain"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn decode_flattened_tool_definition() {
        let req = decode(
            r#"{"model":"m","input":"x","tools":[
                {"type":"function","name":"get_weather","description":"w",
                 "parameters":{"type":"object"}}]}"#,
        );
        assert_eq!(req.tools[0].name, "get_weather");
    }

    #[test]
    fn function_call_pair_is_isomorphic() {
        let original = decode(
            r#"{"model":"m","input":[
                {"type":"message","role":"user","content":"go"},
                {"type":"function_call","call_id":"fc_7","name":"grep",
                 "arguments":"{\"q\":\"needle\"}"},
                {"type":"function_call_output","call_id":"fc_7","output":"found"}]}"#,
        );
        let items = build_input_items(&original);
        let body = json!({"model": "m", "input": items}).to_string();
        let again = decode(&body);
        assert_eq!(again.messages, original.messages);
    }

    #[test]
    fn encode_response_splits_text_and_function_calls() {
        let resp = CanonicalResponse {
            model: "up".into(),
            blocks: vec![
                AssistantBlock::text("calling"),
                AssistantBlock::tool_use("fc_1", "grep", json!({"q": "x"})),
            ],
            stop_reason: StopReason::ToolUse,
            usage: crate::canonical::Usage {
                input_tokens: 2,
                output_tokens: 3,
            },
        };
        let v = encode_response(&resp, "client-m", "resp_1", 0);
        assert_eq!(v["object"], "response");
        assert_eq!(v["model"], "client-m");
        assert_eq!(v["output"][0]["type"], "message");
        assert_eq!(v["output"][1]["type"], "function_call");
        assert_eq!(v["output"][1]["call_id"], "fc_1");
        assert_eq!(v["usage"]["total_tokens"], 5);
    }

    #[test]
    fn stream_emits_expected_event_sequence() {
        let resp = CanonicalResponse {
            model: "up".into(),
            blocks: vec![AssistantBlock::text("answer")],
            stop_reason: StopReason::EndTurn,
            usage: Default::default(),
        };
        let frames = synthesize_stream(&resp, "client-m", "resp_1", 0);
        assert!(frames[0].starts_with("event: response.created\n"));
        assert!(frames
            .iter()
            .any(|f| f.starts_with("event: response.output_item.added\n")));
        assert!(frames
            .iter()
            .any(|f| f.starts_with("event: response.output_text.delta\n")));
        assert!(frames
            .iter()
            .any(|f| f.starts_with("event: response.completed\n")));
        assert_eq!(frames.last().unwrap(), SSE_DONE);
        assert!(frames[0].contains("\"model\":\"client-m\""));
    }
}
