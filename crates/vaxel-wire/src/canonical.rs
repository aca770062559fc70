// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a message.
///
/// Images are carried as URLs (`data:<mime>;base64,<b64>` or HTTPS); the
/// dialect translators convert to each provider's source representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        /// String or array of blocks, kept opaque so dialect round-trips are
        /// lossless.
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: image_url.into(),
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: Value::String(content.into()),
            is_error: false,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: Value::String(message.into()),
            is_error: true,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Message content — either a plain string (one text block) or an ordered
/// sequence of content blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Iterate the content as blocks; a plain string yields one text block.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::Text(t) => vec![ContentBlock::text(t.clone())],
            Self::Blocks(b) => b.clone(),
        }
    }

    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Plain text of this message when it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// All image URLs carried by this message.
    pub fn image_urls(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ImageUrl { image_url } => Some(image_url.as_str()),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    /// True when this message carries at least one `tool_use` block.
    pub fn has_tool_use(&self) -> bool {
        matches!(&self.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })))
    }

    /// Approximate token count: 4 chars per token over all text content,
    /// minimum 1. Used by the count-tokens endpoint and quota estimation.
    pub fn approx_tokens(&self) -> u32 {
        let chars: usize = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ImageUrl { .. } => 0,
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentBlock::ToolResult { content, .. } => content.to_string().len(),
                })
                .sum(),
        };
        ((chars / 4) as u32).max(1)
    }
}

// ─── System prompt ────────────────────────────────────────────────────────────

/// System prompt as accepted on the wire: a plain string or an array of
/// text blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl SystemPrompt {
    pub fn joined_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

/// A tool schema offered to the model. `name` is unique within one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: Value,
}

// ─── Metadata ─────────────────────────────────────────────────────────────────

/// Typed view of the recognised metadata keys, with a side-map for opaque
/// pass-through keys. Keeping the enum of recognised keys closed removes the
/// runtime type assertions a `map[string]any` carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_supports_vision: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_reflection_passes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_candidates: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_response_judge: Option<bool>,
    /// Explicit adapter candidate list; overrides all routing rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_adapter_route: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_loop_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_loop_max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_emulation_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_planner_model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_aliases: BTreeMap<String, String>,
    /// Unrecognised keys, forwarded verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl RequestMetadata {
    /// Absorb one wire-level metadata key into the typed struct. Unknown
    /// keys land in `extra`.
    pub fn set(&mut self, key: &str, value: Value) {
        match key {
            "tool_choice" => self.tool_choice = Some(value),
            "temperature" => self.temperature = value.as_f64(),
            "top_p" => self.top_p = value.as_f64(),
            "session_id" => self.session_id = value.as_str().map(str::to_string),
            "upstream_supports_vision" => self.upstream_supports_vision = value.as_bool(),
            "routing_retries" => self.routing_retries = value.as_u64().map(|v| v as u32),
            "routing_reflection_passes" => {
                self.routing_reflection_passes = value.as_u64().map(|v| v as u32)
            }
            "routing_timeout_ms" => self.routing_timeout_ms = value.as_u64(),
            "parallel_candidates" => self.parallel_candidates = value.as_u64().map(|v| v as u32),
            "enable_response_judge" => self.enable_response_judge = value.as_bool(),
            "routing_adapter_route" => {
                self.routing_adapter_route = value
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default()
            }
            "tool_loop_mode" => self.tool_loop_mode = value.as_str().map(str::to_string),
            "tool_loop_max_steps" => {
                self.tool_loop_max_steps = value.as_u64().map(|v| v as u32)
            }
            "tool_emulation_mode" => {
                self.tool_emulation_mode = value.as_str().map(str::to_string)
            }
            "tool_planner_model" => {
                self.tool_planner_model = value.as_str().map(str::to_string)
            }
            "tool_aliases" => {
                self.tool_aliases = value
                    .as_object()
                    .map(|o| {
                        o.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            }
            _ => {
                self.extra.insert(key.to_string(), value);
            }
        }
    }

    pub fn from_map(map: &serde_json::Map<String, Value>) -> Self {
        let mut meta = Self::default();
        for (k, v) in map {
            meta.set(k, v.clone());
        }
        meta
    }
}

// ─── Canonical request / response ─────────────────────────────────────────────

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// The single internal request shape both dialects translate to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalRequest {
    /// Logical model as requested by the client, before mapping.
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl CanonicalRequest {
    /// Structural validation shared by all dialect decoders.
    ///
    /// Enforces the canonical invariants: at least one message, and every
    /// `tool_result` block referencing a `tool_use` id that appeared earlier
    /// in the sequence.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must contain at least one entry".into(),
            ));
        }
        let mut seen_tool_use: Vec<&str> = Vec::new();
        for msg in &self.messages {
            if let MessageContent::Blocks(blocks) = &msg.content {
                for block in blocks {
                    match block {
                        ContentBlock::ToolUse { id, .. } => seen_tool_use.push(id),
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            if !seen_tool_use.iter().any(|id| id == tool_use_id) {
                                return Err(GatewayError::InvalidRequest(format!(
                                    "tool_result references unknown tool_use id {tool_use_id:?}"
                                )));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        let mut names = std::collections::HashSet::new();
        for tool in &self.tools {
            if !names.insert(tool.name.as_str()) {
                return Err(GatewayError::InvalidRequest(format!(
                    "duplicate tool name {:?}",
                    tool.name
                )));
            }
        }
        Ok(())
    }

    /// Approximate input token count over all text content.
    pub fn approx_input_tokens(&self) -> u32 {
        let system: u32 = self
            .system
            .as_ref()
            .map(|s| ((s.joined_text().len() / 4) as u32).max(1))
            .unwrap_or(0);
        system + self.messages.iter().map(Message::approx_tokens).sum::<u32>()
    }

    /// True when any message carries an image block.
    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| !m.image_urls().is_empty())
    }
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTurns,
    StopSequence,
    Length,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One assistant output block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

impl AssistantBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The single internal response shape both dialects translate from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalResponse {
    /// Upstream model that actually produced the output.
    pub model: String,
    pub blocks: Vec<AssistantBlock>,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: Usage,
}

impl CanonicalResponse {
    /// All `tool_use` blocks in output order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, AssistantBlock::ToolUse { .. }))
    }

    /// True when the final block is a `tool_use` — drives the outward
    /// OpenAI finish reason.
    pub fn ends_with_tool_use(&self) -> bool {
        matches!(self.blocks.last(), Some(AssistantBlock::ToolUse { .. }))
    }

    /// Concatenated text of all text blocks.
    pub fn joined_text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Convert the assistant output back into a conversation message, for
    /// appending to the tool-loop accumulator.
    pub fn to_assistant_message(&self) -> Message {
        let blocks = self
            .blocks
            .iter()
            .map(|b| match b {
                AssistantBlock::Text { text } => ContentBlock::text(text.clone()),
                AssistantBlock::ToolUse { id, name, input } => {
                    ContentBlock::tool_use(id.clone(), name.clone(), input.clone())
                }
            })
            .collect();
        Message::assistant_blocks(blocks)
    }
}

/// Fresh run identifier, `run_` + UUID v4 simple form.
pub fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4().simple())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn minimal_request() -> CanonicalRequest {
        CanonicalRequest {
            model: "claude-test".into(),
            messages: vec![Message::user("hello")],
            system: None,
            tools: vec![],
            max_tokens: 128,
            stream: false,
            metadata: RequestMetadata::default(),
        }
    }

    #[test]
    fn validate_accepts_minimal_request() {
        assert!(minimal_request().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let mut req = minimal_request();
        req.messages.clear();
        assert!(matches!(
            req.validate(),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn validate_rejects_orphan_tool_result() {
        let mut req = minimal_request();
        req.messages.push(Message::user_blocks(vec![
            ContentBlock::tool_result("toolu_missing", "out"),
        ]));
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_accepts_linked_tool_result() {
        let mut req = minimal_request();
        req.messages.push(Message::assistant_blocks(vec![
            ContentBlock::tool_use("toolu_1", "get_weather", json!({"city": "Oslo"})),
        ]));
        req.messages.push(Message::user_blocks(vec![
            ContentBlock::tool_result("toolu_1", "sunny"),
        ]));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn validate_rejects_result_before_use() {
        let req = CanonicalRequest {
            messages: vec![
                Message::user_blocks(vec![ContentBlock::tool_result("toolu_1", "out")]),
                Message::assistant_blocks(vec![ContentBlock::tool_use(
                    "toolu_1",
                    "t",
                    json!({}),
                )]),
            ],
            ..minimal_request()
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_tool_names() {
        let mut req = minimal_request();
        let spec = ToolSpec {
            name: "get_weather".into(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        };
        req.tools = vec![spec.clone(), spec];
        assert!(req.validate().is_err());
    }

    #[test]
    fn approx_tokens_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("hi").approx_tokens(), 1);
    }

    #[test]
    fn approx_input_tokens_includes_system() {
        let mut req = minimal_request();
        req.system = Some(SystemPrompt::Text("abcdefgh".into()));
        // system 2 + "hello" 1
        assert_eq!(req.approx_input_tokens(), 3);
    }

    #[test]
    fn metadata_known_key_is_typed() {
        let mut meta = RequestMetadata::default();
        meta.set("routing_retries", json!(3));
        assert_eq!(meta.routing_retries, Some(3));
        assert!(meta.extra.is_empty());
    }

    #[test]
    fn metadata_unknown_key_lands_in_extra() {
        let mut meta = RequestMetadata::default();
        meta.set("trace_flavor", json!("vanilla"));
        assert_eq!(meta.extra["trace_flavor"], "vanilla");
    }

    #[test]
    fn metadata_adapter_route_parsed_as_list() {
        let mut meta = RequestMetadata::default();
        meta.set("routing_adapter_route", json!(["primary", "backup"]));
        assert_eq!(meta.routing_adapter_route, vec!["primary", "backup"]);
    }

    #[test]
    fn metadata_tool_aliases_parsed_as_map() {
        let mut meta = RequestMetadata::default();
        meta.set("tool_aliases", json!({"bash": "shell"}));
        assert_eq!(meta.tool_aliases["bash"], "shell");
    }

    #[test]
    fn ends_with_tool_use_checks_last_block() {
        let resp = CanonicalResponse {
            model: "m".into(),
            blocks: vec![
                AssistantBlock::text("thinking"),
                AssistantBlock::tool_use("toolu_1", "grep", json!({})),
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        };
        assert!(resp.ends_with_tool_use());
        let resp2 = CanonicalResponse {
            blocks: vec![AssistantBlock::text("done")],
            stop_reason: StopReason::EndTurn,
            ..resp
        };
        assert!(!resp2.ends_with_tool_use());
    }

    #[test]
    fn to_assistant_message_preserves_tool_use() {
        let resp = CanonicalResponse {
            model: "m".into(),
            blocks: vec![AssistantBlock::tool_use("toolu_9", "shell", json!({"cmd": "ls"}))],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        };
        let msg = resp.to_assistant_message();
        assert!(msg.has_tool_use());
        assert_eq!(msg.role, Role::Assistant);
    }

    #[test]
    fn stop_reason_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&StopReason::EndTurn).unwrap(),
            "\"end_turn\""
        );
        assert_eq!(
            serde_json::to_string(&StopReason::MaxTurns).unwrap(),
            "\"max_turns\""
        );
    }

    #[test]
    fn canonical_request_round_trips_through_json() {
        let mut req = minimal_request();
        req.tools = vec![ToolSpec {
            name: "get_weather".into(),
            description: "weather".into(),
            input_schema: json!({"type": "object"}),
        }];
        let text = serde_json::to_string(&req).unwrap();
        let back: CanonicalRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
        assert!(new_run_id().starts_with("run_"));
    }
}
