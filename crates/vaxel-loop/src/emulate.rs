// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tool-call emulation for upstreams without native tool support.
//!
//! `json` mode instructs the model to answer with a single
//! `{"tool": <name>, "input": {…}}` object; the parser takes the first
//! balanced top-level JSON object in the assistant text (code fences are
//! accepted, further objects are ignored). `react` mode parses the
//! `Thought:/Action:/Action Input:` convention. `hybrid` tries `json`
//! first and falls back to `react`.

use serde_json::{json, Value};
use vaxel_settings::EmulationMode;
use vaxel_wire::ToolSpec;

/// A tool call recovered from plain assistant text.
#[derive(Debug, Clone, PartialEq)]
pub struct EmulatedCall {
    pub name: String,
    pub input: Value,
}

/// Extract the first balanced top-level JSON object from `text`.
///
/// Handles string literals and escapes so braces inside strings do not
/// unbalance the scan; a leading code fence is skipped transparently
/// because the scan just looks for the first `{`.
pub fn extract_first_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse `json`-mode output: `{"tool": <name>, "input": {…}}`.
pub fn parse_json_call(text: &str) -> Option<EmulatedCall> {
    let obj = extract_first_json_object(text)?;
    let name = obj["tool"].as_str()?.to_string();
    if name.is_empty() {
        return None;
    }
    let input = obj.get("input").cloned().unwrap_or_else(|| json!({}));
    Some(EmulatedCall { name, input })
}

/// Parse `react`-mode output:
/// ```text
/// Thought: I should look this up.
/// Action: get_weather
/// Action Input: {"city": "Oslo"}
/// ```
/// A non-JSON action input is wrapped as `{"input": <raw>}`.
pub fn parse_react_call(text: &str) -> Option<EmulatedCall> {
    let mut name: Option<String> = None;
    let mut input_raw: Option<String> = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Action:") {
            if name.is_none() {
                name = Some(rest.trim().to_string());
            }
        } else if let Some(rest) = line.strip_prefix("Action Input:") {
            if name.is_some() && input_raw.is_none() {
                input_raw = Some(rest.trim().to_string());
            }
        }
    }
    let name = name.filter(|n| !n.is_empty())?;
    let input = match input_raw {
        Some(raw) if !raw.is_empty() => extract_first_json_object(&raw)
            .unwrap_or_else(|| json!({ "input": raw })),
        _ => json!({}),
    };
    Some(EmulatedCall { name, input })
}

/// Parse according to the configured mode. `Native` never parses.
pub fn parse_call(mode: EmulationMode, text: &str) -> Option<EmulatedCall> {
    match mode {
        EmulationMode::Native => None,
        EmulationMode::Json => parse_json_call(text),
        EmulationMode::React => parse_react_call(text),
        EmulationMode::Hybrid => parse_json_call(text).or_else(|| parse_react_call(text)),
    }
}

/// Deterministic id for an emulated call on the given turn.
pub fn emulated_id(turn: u32) -> String {
    format!("toolu_emu_{turn}")
}

/// The system-prompt suffix instructing the model how to call tools
/// without native support.
pub fn instructions(mode: EmulationMode, tools: &[ToolSpec]) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    let listing: String = tools
        .iter()
        .map(|t| {
            format!(
                "- {}: {}\n  input schema: {}",
                t.name, t.description, t.input_schema
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    match mode {
        EmulationMode::Native => None,
        EmulationMode::Json | EmulationMode::Hybrid => Some(format!(
            "You can call tools. Available tools:\n{listing}\n\n\
             To call a tool, reply with exactly one JSON object and nothing else:\n\
             {{\"tool\": \"<tool name>\", \"input\": {{...}}}}\n\
             When you have the final answer, reply with plain text instead."
        )),
        EmulationMode::React => Some(format!(
            "You can call tools. Available tools:\n{listing}\n\n\
             To call a tool, reply in this exact format:\n\
             Thought: <your reasoning>\n\
             Action: <tool name>\n\
             Action Input: <JSON input object>\n\
             When you have the final answer, reply with plain text instead."
        )),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
