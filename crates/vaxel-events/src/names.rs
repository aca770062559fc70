// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical lifecycle event names.
//!
//! Producers use these constants instead of string literals so the
//! observability API and tests agree on spelling.

/// A run (one gateway request) started processing.
pub const RUN_STARTED: &str = "run.started";
/// A run finished; `data.status` is `ok`, `error`, or `cancelled`.
pub const RUN_COMPLETED: &str = "run.completed";

/// Dialect decoding rejected the body outright.
pub const REQUEST_DECODE_FAILED: &str = "request.decode_failed";
/// An admin endpoint rejected unknown top-level fields.
pub const REQUEST_UNSUPPORTED_FIELDS: &str = "request.unsupported_fields";

/// A tool name was rewritten through the alias table.
pub const TOOL_ALIAS_APPLIED: &str = "tool.alias_applied";
/// No local executor and no MCP server could handle a tool call.
pub const TOOL_GAP_DETECTED: &str = "tool.gap_detected";
/// A tool call was synthesised from emulated (non-native) model output.
pub const TOOL_EMULATED_CALL: &str = "tool.emulated_call";
/// The request was silently switched to the server-side tool loop because
/// the chosen upstream cannot do native tool calls.
pub const TOOL_FALLBACK_APPLIED: &str = "tool.fallback_applied";
/// One tool invocation finished inside the server-side loop.
pub const TOOL_CALL_FINISHED: &str = "tool.call_finished";

/// Image blocks were replaced with a textual fallback block.
pub const VISION_FALLBACK_APPLIED: &str = "vision.fallback_applied";

/// The scheduler put an adapter into cooldown.
pub const ADAPTER_COOLDOWN: &str = "adapter.cooldown";
/// A background probe finished for one adapter.
pub const PROBE_RESULT: &str = "probe.result";

/// Runtime settings were replaced via the admin API.
pub const SETTINGS_UPDATED: &str = "settings.updated";
/// The channel store rebuilt its ability index.
pub const CHANNELS_REBUILT: &str = "channels.rebuilt";
