// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should default on need a named function.
fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_parallel_candidates() -> u32 {
    1
}
fn default_max_steps() -> u32 {
    4
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_probe_interval_secs() -> u64 {
    45
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_mcp_ttl_secs() -> u64 {
    60
}
fn default_rate_rps() -> u32 {
    50
}
fn default_rate_burst() -> u32 {
    100
}

/// The whole runtime configuration, replaced atomically through the
/// settings store. Every request reads a snapshot of this value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub tool_loop: ToolLoopSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Per-mode model overrides; key is the mode label (`chat`, `plan`, …),
    /// the `default` key applies when the request's mode has no entry.
    #[serde(default)]
    pub mode_models: HashMap<String, String>,
    #[serde(default)]
    pub use_mode_model_override: bool,

    /// Logical → upstream model map. Keys may contain `*` globs; exact
    /// matches win, then longest specificity.
    #[serde(default)]
    pub model_mappings: HashMap<String, String>,
    /// Applied when no mapping matches. `None` passes the requested model
    /// through unchanged (unless strict).
    #[serde(default)]
    pub model_map_fallback: Option<String>,
    /// Reject requests whose model has no mapping and no fallback.
    #[serde(default)]
    pub model_map_strict: bool,

    /// Model glob → vision capability; consulted by the capability
    /// resolver before adapter hints.
    #[serde(default)]
    pub vision_support_hints: HashMap<String, bool>,

    /// Requested tool name → catalog tool name.
    #[serde(default)]
    pub tool_aliases: HashMap<String, String>,
    #[serde(default)]
    pub allow_experimental_tools: bool,

    /// Seconds an MCP server's `tools/list` result stays cached.
    #[serde(default = "default_mcp_ttl_secs")]
    pub mcp_list_tools_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingSettings {
    /// Transient upstream failures retried across eligible adapters.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub reflection_passes: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_parallel_candidates")]
    pub parallel_candidates: u32,
    #[serde(default)]
    pub enable_response_judge: bool,
    /// Mode label → ordered adapter candidate list.
    #[serde(default)]
    pub mode_routes: HashMap<String, Vec<String>>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            retries: 0,
            reflection_passes: 0,
            timeout_ms: default_timeout_ms(),
            parallel_candidates: default_parallel_candidates(),
            enable_response_judge: false,
            mode_routes: HashMap::new(),
        }
    }
}

/// Who drives the tool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolLoopMode {
    /// Tool results come back from the client; the gateway just proxies.
    #[default]
    ClientLoop,
    /// The gateway executes tools and loops server-side.
    ServerLoop,
    Native,
    React,
    Json,
    Hybrid,
}

impl ToolLoopMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_loop" => Some(Self::ClientLoop),
            "server_loop" => Some(Self::ServerLoop),
            "native" => Some(Self::Native),
            "react" => Some(Self::React),
            "json" => Some(Self::Json),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// Strategy for inducing tool calls on an upstream without native support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmulationMode {
    #[default]
    Native,
    React,
    Json,
    Hybrid,
}

impl EmulationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "native" => Some(Self::Native),
            "react" => Some(Self::React),
            "json" => Some(Self::Json),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolLoopSettings {
    #[serde(default)]
    pub mode: ToolLoopMode,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default)]
    pub emulation_mode: EmulationMode,
    /// Model used for tool-use turns; the final answer turn keeps the
    /// requested model.
    #[serde(default)]
    pub planner_model: Option<String>,
}

impl Default for ToolLoopSettings {
    fn default() -> Self {
        Self {
            mode: ToolLoopMode::ClientLoop,
            max_steps: default_max_steps(),
            emulation_mode: EmulationMode::Native,
            planner_model: None,
        }
    }
}

/// Wire protocol an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Openai,
    Anthropic,
    Mock,
    Script,
}

/// Tri-state capability hints; absent means unknown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_tools: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_vision: Option<bool>,
}

/// One configured upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterSpec {
    /// Unique within the settings value.
    pub name: String,
    pub kind: AdapterKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key; read at construction time
    /// so the key itself never lands in the settings value.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Additional headers sent on every request.
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
    #[serde(flatten)]
    pub capabilities: CapabilityHints,
    /// For `kind = script`/`mock`: inline response scripts keyed by turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamSettings {
    #[serde(default)]
    pub adapters: Vec<AdapterSpec>,
    /// Model glob → ordered adapter candidate list.
    #[serde(default)]
    pub model_routes: HashMap<String, Vec<String>>,
    /// Used when nothing else matches; empty means "all adapters in
    /// declaration order".
    #[serde(default)]
    pub default_route: Vec<String>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// When set, only adapters whose last probe succeeded are eligible.
    #[serde(default)]
    pub strict_probe_gate: bool,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            adapters: Vec::new(),
            model_routes: HashMap::new(),
            default_route: Vec::new(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            strict_probe_gate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    /// Also exercise the streaming path.
    #[serde(default)]
    pub stream_smoke: bool,
    /// Also exercise the tool-call path.
    #[serde(default)]
    pub tool_smoke: bool,
    /// Models probed against every adapter; empty uses a single default.
    #[serde(default)]
    pub models: Vec<String>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_probe_interval_secs(),
            timeout_secs: default_probe_timeout_secs(),
            stream_smoke: false,
            tool_smoke: false,
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitSettings {
    #[serde(default = "default_rate_rps")]
    pub rps: u32,
    #[serde(default = "default_rate_burst")]
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rps: default_rate_rps(),
            burst: default_rate_burst(),
        }
    }
}

// ─── Sanitisation ─────────────────────────────────────────────────────────────

fn clean_map(map: &mut HashMap<String, String>) {
    let cleaned: HashMap<String, String> = map
        .drain()
        .filter_map(|(k, v)| {
            let k = k.trim().to_string();
            if k.is_empty() {
                None
            } else {
                Some((k, v.trim().to_string()))
            }
        })
        .collect();
    *map = cleaned;
}

impl RuntimeSettings {
    /// Enforce the invariants every consumer relies on. Applied by the
    /// store on every `put`, so no snapshot ever carries an invalid value.
    pub fn sanitize(&mut self) {
        if self.routing.timeout_ms == 0 {
            self.routing.timeout_ms = default_timeout_ms();
        }
        if self.routing.parallel_candidates == 0 {
            self.routing.parallel_candidates = default_parallel_candidates();
        }
        if self.tool_loop.max_steps == 0 {
            self.tool_loop.max_steps = default_max_steps();
        }
        if self.upstream.failure_threshold == 0 {
            self.upstream.failure_threshold = default_failure_threshold();
        }
        if let Some(p) = &self.tool_loop.planner_model {
            let trimmed = p.trim();
            self.tool_loop.planner_model = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
        clean_map(&mut self.model_mappings);
        clean_map(&mut self.mode_models);
        clean_map(&mut self.tool_aliases);
        self.vision_support_hints.retain(|k, _| !k.trim().is_empty());
        self.routing.mode_routes.retain(|k, _| !k.trim().is_empty());
        self.upstream.model_routes.retain(|k, _| !k.trim().is_empty());
        if let Some(fb) = &self.model_map_fallback {
            let trimmed = fb.trim();
            self.model_map_fallback = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
