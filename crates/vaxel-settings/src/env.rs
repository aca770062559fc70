// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Settings assembly: defaults, then an optional YAML config file, then
//! environment variables. Later layers override earlier ones; the result
//! goes through [`RuntimeSettings::sanitize`] via the store.

use std::path::Path;

use anyhow::Context;
use tracing::debug;

use crate::schema::RuntimeSettings;

/// Load settings from an optional YAML file, then apply env overrides.
pub fn load(config_file: Option<&Path>) -> anyhow::Result<RuntimeSettings> {
    let mut settings = match config_file {
        Some(path) => {
            debug!(path = %path.display(), "loading settings file");
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => RuntimeSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

/// Apply the recognised environment variables on top of `settings`.
///
/// `lookup` abstracts `std::env::var` so tests can inject values without
/// touching process state.
pub fn apply_env_overrides(
    settings: &mut RuntimeSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    // Full JSON overlay first so the narrower vars below still win.
    if let Some(raw) = lookup("RUNTIME_SETTINGS_JSON") {
        *settings =
            serde_json::from_str(&raw).context("parsing RUNTIME_SETTINGS_JSON")?;
    }

    if let Some(raw) = lookup("MODEL_MAP_JSON") {
        settings.model_mappings =
            serde_json::from_str(&raw).context("parsing MODEL_MAP_JSON")?;
    }
    if let Some(raw) = lookup("MODEL_MAP_STRICT") {
        settings.model_map_strict = parse_bool(&raw);
    }
    if let Some(raw) = lookup("MODEL_MAP_FALLBACK") {
        settings.model_map_fallback = if raw.trim().is_empty() {
            None
        } else {
            Some(raw.trim().to_string())
        };
    }

    if let Some(raw) = lookup("PROBE_ENABLED") {
        settings.probe.enabled = parse_bool(&raw);
    }
    if let Some(raw) = lookup("PROBE_INTERVAL") {
        settings.probe.interval_secs = parse_duration_secs(&raw)
            .with_context(|| format!("parsing PROBE_INTERVAL {raw:?}"))?;
    }
    if let Some(raw) = lookup("PROBE_TIMEOUT") {
        settings.probe.timeout_secs = parse_duration_secs(&raw)
            .with_context(|| format!("parsing PROBE_TIMEOUT {raw:?}"))?;
    }
    if let Some(raw) = lookup("PROBE_STREAM_SMOKE") {
        settings.probe.stream_smoke = parse_bool(&raw);
    }
    if let Some(raw) = lookup("PROBE_TOOL_SMOKE") {
        settings.probe.tool_smoke = parse_bool(&raw);
    }
    // JSON list wins over the comma form when both are set.
    if let Some(raw) = lookup("PROBE_MODELS") {
        settings.probe.models = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(raw) = lookup("PROBE_MODELS_JSON") {
        settings.probe.models =
            serde_json::from_str(&raw).context("parsing PROBE_MODELS_JSON")?;
    }

    if let Some(raw) = lookup("RATE_LIMIT_RPS") {
        settings.rate_limit.rps = raw
            .trim()
            .parse()
            .with_context(|| format!("parsing RATE_LIMIT_RPS {raw:?}"))?;
    }
    if let Some(raw) = lookup("RATE_LIMIT_BURST") {
        settings.rate_limit.burst = raw
            .trim()
            .parse()
            .with_context(|| format!("parsing RATE_LIMIT_BURST {raw:?}"))?;
    }
    Ok(())
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "yes" | "on")
}

/// Accept both bare seconds (`45`) and humantime forms (`45s`, `2m`).
fn parse_duration_secs(raw: &str) -> anyhow::Result<u64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(secs);
    }
    let d = humantime::parse_duration(raw)?;
    Ok(d.as_secs())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
