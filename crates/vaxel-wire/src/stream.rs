// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Streaming events flowing from the router to the dialect encoders.
//!
//! Two regimes share this type. *Structured* events are produced by the
//! gateway itself (mock adapters, the tool loop's synthesised final turn)
//! and carry parsed fields. *Passthrough* events carry the raw SSE payload
//! bytes from an upstream whose dialect matches the client's, so the byte
//! stream is preserved exactly — except for the model rewrite in
//! `message_start`/`response.created` payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{StopReason, Usage};

/// Delta within one content block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

/// One streamed event from an adapter or the tool loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        /// Upstream model; dialect encoders rewrite this to the client's
        /// requested model before emission.
        model: String,
        usage: Usage,
    },
    ContentBlockStart {
        index: u32,
        /// `text` or `tool_use` block header (empty input for tool_use;
        /// arguments arrive as `InputJsonDelta`s).
        block: Value,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
    MessageStop,
    /// Raw SSE payload from upstream, forwarded byte-accurately.
    Passthrough {
        /// SSE event name if the upstream named one.
        event: Option<String>,
        raw: Vec<u8>,
    },
}

/// Format one SSE frame: `event: <name>` + `data: <json>` + blank line.
pub fn sse_frame(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Format a data-only SSE frame (OpenAI style).
pub fn sse_data(data: &Value) -> String {
    format!("data: {data}\n\n")
}

/// The OpenAI stream terminator.
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Rewrite `payload[field]` to `model` when present, returning the
/// re-serialised bytes. Non-JSON payloads pass through untouched.
pub fn rewrite_model_field(raw: &[u8], field_path: &[&str], model: &str) -> Vec<u8> {
    let Ok(mut v) = serde_json::from_slice::<Value>(raw) else {
        return raw.to_vec();
    };
    let mut slot = &mut v;
    for key in field_path {
        match slot.get_mut(*key) {
            Some(next) => slot = next,
            None => return raw.to_vec(),
        }
    }
    if slot.is_string() {
        *slot = Value::String(model.to_string());
        serde_json::to_vec(&v).unwrap_or_else(|_| raw.to_vec())
    } else {
        raw.to_vec()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sse_frame_has_event_and_data_lines() {
        let frame = sse_frame("message_stop", &json!({"type": "message_stop"}));
        assert!(frame.starts_with("event: message_stop\n"));
        assert!(frame.contains("data: {\"type\":\"message_stop\"}"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn sse_data_is_data_only() {
        let frame = sse_data(&json!({"x": 1}));
        assert_eq!(frame, "data: {\"x\":1}\n\n");
    }

    #[test]
    fn rewrite_model_replaces_nested_field() {
        let raw = br#"{"type":"message_start","message":{"model":"upstream-x","id":"m1"}}"#;
        let out = rewrite_model_field(raw, &["message", "model"], "client-y");
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["message"]["model"], "client-y");
        assert_eq!(v["message"]["id"], "m1");
    }

    #[test]
    fn rewrite_model_ignores_missing_path() {
        let raw = br#"{"type":"ping"}"#;
        let out = rewrite_model_field(raw, &["message", "model"], "client-y");
        assert_eq!(out, raw.to_vec());
    }

    #[test]
    fn rewrite_model_passes_non_json_through() {
        let raw = b"not json at all";
        let out = rewrite_model_field(raw, &["model"], "m");
        assert_eq!(out, raw.to_vec());
    }
}
