// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Route selection and adapter scheduling.
//!
//! Route selection is a pure function over settings and request metadata;
//! the scheduler then walks the candidate list in order, skipping
//! ineligible adapters, and retries transient failures on the next
//! candidate up to the configured retry budget. Permanent upstream
//! failures (4xx except 408/429) stop the walk immediately — they are the
//! caller's problem, not the adapter's.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use tracing::{debug, warn};
use vaxel_settings::{glob_match, AdapterKind, RuntimeSettings};
use vaxel_wire::{CanonicalRequest, CanonicalResponse, GatewayError};

use crate::{
    adapter::{AdapterError, EventStream, UpstreamAdapter},
    anthropic_upstream::AnthropicUpstream,
    health::{HealthDelta, HealthRegistry},
    mock,
    openai_upstream::OpenAiUpstream,
};

/// Compute the candidate adapter list for one request.
pub fn select_route(
    settings: &RuntimeSettings,
    req: &CanonicalRequest,
    mode: &str,
    all_adapters: &[String],
) -> Vec<String> {
    // 1. Explicit per-request route wins outright.
    if !req.metadata.routing_adapter_route.is_empty() {
        return req.metadata.routing_adapter_route.clone();
    }
    // 2. Per-mode route.
    if let Some(route) = settings.routing.mode_routes.get(mode) {
        if !route.is_empty() {
            return route.clone();
        }
    }
    // 3. Model-glob routes, longest specificity first.
    if let Some(route) = settings.upstream.model_routes.get(&req.model) {
        if !route.is_empty() {
            return route.clone();
        }
    }
    let best = settings
        .upstream
        .model_routes
        .iter()
        .filter(|(pattern, route)| {
            pattern.contains('*') && !route.is_empty() && glob_match(pattern, &req.model)
        })
        .min_by(|(a, _), (b, _)| {
            let spec_a = a.chars().filter(|c| *c != '*').count();
            let spec_b = b.chars().filter(|c| *c != '*').count();
            spec_b.cmp(&spec_a).then_with(|| a.cmp(b))
        });
    if let Some((_, route)) = best {
        return route.clone();
    }
    // 4. Default route; empty means every adapter in declaration order.
    if !settings.upstream.default_route.is_empty() {
        return settings.upstream.default_route.clone();
    }
    all_adapters.to_vec()
}

pub struct Scheduler {
    adapters: RwLock<HashMap<String, Arc<dyn UpstreamAdapter>>>,
    /// Declaration order, used when the default route is empty.
    order: RwLock<Vec<String>>,
    registry: Arc<HealthRegistry>,
}

impl Scheduler {
    pub fn new(registry: Arc<HealthRegistry>) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    pub fn register(&self, adapter: Arc<dyn UpstreamAdapter>) {
        let name = adapter.name().to_string();
        self.registry.register(&name);
        let mut order = self.order.write().expect("order lock poisoned");
        if !order.contains(&name) {
            order.push(name.clone());
        }
        self.adapters
            .write()
            .expect("adapter lock poisoned")
            .insert(name, adapter);
    }

    /// Construct and register every adapter in the settings value. Existing
    /// registrations with the same name are replaced; health is preserved.
    pub fn rebuild_from_settings(&self, settings: &RuntimeSettings) -> anyhow::Result<()> {
        for spec in &settings.upstream.adapters {
            let adapter: Arc<dyn UpstreamAdapter> = match spec.kind {
                AdapterKind::Openai => Arc::new(OpenAiUpstream::from_spec(spec)),
                AdapterKind::Anthropic => Arc::new(AnthropicUpstream::from_spec(spec)),
                AdapterKind::Mock | AdapterKind::Script => mock::from_spec(spec)?,
            };
            self.register(adapter);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn UpstreamAdapter>> {
        self.adapters
            .read()
            .expect("adapter lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.order.read().expect("order lock poisoned").clone()
    }

    /// First eligible candidate in list order. The probe gate applies on
    /// the first pass; when nothing qualifies and the gate is not strict,
    /// the pass repeats without it.
    pub fn pick(
        &self,
        candidates: &[String],
        strict_probe_gate: bool,
        exclude: &HashSet<String>,
    ) -> Result<Arc<dyn UpstreamAdapter>, GatewayError> {
        for gated in [true, false] {
            if !gated && strict_probe_gate {
                break;
            }
            for name in candidates {
                if exclude.contains(name) {
                    continue;
                }
                let Some(adapter) = self.get(name) else {
                    continue;
                };
                if self.registry.eligible(name, gated) {
                    return Ok(adapter);
                }
            }
        }
        Err(GatewayError::UpstreamUnavailable(
            "no eligible adapter in route".into(),
        ))
    }

    /// Non-streaming completion with retry-on-transient across the route.
    pub async fn complete_with_retries(
        &self,
        candidates: &[String],
        req: &CanonicalRequest,
        upstream_model: &str,
        retries: u32,
        strict_probe_gate: bool,
    ) -> Result<CanonicalResponse, GatewayError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error = String::new();
        for attempt in 0..=retries {
            let adapter = match self.pick(candidates, strict_probe_gate, &tried) {
                Ok(a) => a,
                Err(e) => {
                    if last_error.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            };
            let name = adapter.name().to_string();
            debug!(adapter = %name, attempt, "dispatching completion");
            match adapter.complete(req, upstream_model).await {
                Ok(resp) => {
                    self.registry.report(HealthDelta::Success { adapter: name });
                    return Ok(resp);
                }
                Err(AdapterError::Transient(msg)) => {
                    warn!(adapter = %name, error = %msg, "transient upstream failure");
                    self.registry
                        .report(HealthDelta::TransientFailure { adapter: name.clone() });
                    tried.insert(name);
                    last_error = msg;
                }
                Err(AdapterError::Permanent(msg)) => {
                    // Request-level problem; no health mutation, no retry.
                    return Err(GatewayError::InvalidRequest(msg));
                }
            }
        }
        Err(GatewayError::UpstreamUnavailable(format!(
            "all adapters in route failed (last error: {last_error})"
        )))
    }

    /// Open a stream, retrying setup failures across the route. Mid-stream
    /// failures are the caller's to observe; only connection setup retries.
    pub async fn stream_with_retries(
        &self,
        candidates: &[String],
        req: &CanonicalRequest,
        upstream_model: &str,
        retries: u32,
        strict_probe_gate: bool,
    ) -> Result<(Arc<dyn UpstreamAdapter>, EventStream), GatewayError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error = String::new();
        for _ in 0..=retries {
            let adapter = match self.pick(candidates, strict_probe_gate, &tried) {
                Ok(a) => a,
                Err(e) => {
                    if last_error.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            };
            let name = adapter.name().to_string();
            match adapter.stream(req, upstream_model).await {
                Ok(stream) => {
                    self.registry
                        .report(HealthDelta::Success { adapter: name });
                    return Ok((adapter, stream));
                }
                Err(AdapterError::Transient(msg)) => {
                    self.registry
                        .report(HealthDelta::TransientFailure { adapter: name.clone() });
                    tried.insert(name);
                    last_error = msg;
                }
                Err(AdapterError::Permanent(msg)) => {
                    return Err(GatewayError::InvalidRequest(msg));
                }
            }
        }
        Err(GatewayError::UpstreamUnavailable(format!(
            "all adapters in route failed (last error: {last_error})"
        )))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vaxel_wire::Message;

    use super::*;
    use crate::mock::{MockAdapter, ScriptedAdapter};

    fn request(model: &str) -> CanonicalRequest {
        CanonicalRequest {
            model: model.into(),
            messages: vec![Message::user("hi")],
            system: None,
            tools: vec![],
            max_tokens: 16,
            stream: false,
            metadata: Default::default(),
        }
    }

    fn scheduler() -> Scheduler {
        let (registry, _) = HealthRegistry::new(3, Duration::from_secs(60));
        Scheduler::new(registry)
    }

    // ── select_route ──────────────────────────────────────────────────────────

    #[test]
    fn metadata_route_wins() {
        let mut req = request("m");
        req.metadata.routing_adapter_route = vec!["explicit".into()];
        let settings = RuntimeSettings::default();
        let route = select_route(&settings, &req, "chat", &["a".into()]);
        assert_eq!(route, vec!["explicit"]);
    }

    #[test]
    fn mode_route_beats_model_route() {
        let mut settings = RuntimeSettings::default();
        settings
            .routing
            .mode_routes
            .insert("plan".into(), vec!["plan-adapter".into()]);
        settings
            .upstream
            .model_routes
            .insert("m".into(), vec!["model-adapter".into()]);
        let route = select_route(&settings, &request("m"), "plan", &[]);
        assert_eq!(route, vec!["plan-adapter"]);
    }

    #[test]
    fn model_glob_longest_specificity_wins() {
        let mut settings = RuntimeSettings::default();
        settings
            .upstream
            .model_routes
            .insert("claude-*".into(), vec!["short".into()]);
        settings
            .upstream
            .model_routes
            .insert("claude-3-*".into(), vec!["long".into()]);
        let route = select_route(&settings, &request("claude-3-opus"), "chat", &[]);
        assert_eq!(route, vec!["long"]);
    }

    #[test]
    fn default_route_then_all_adapters() {
        let mut settings = RuntimeSettings::default();
        settings.upstream.default_route = vec!["fallback".into()];
        let route = select_route(&settings, &request("m"), "chat", &["x".into()]);
        assert_eq!(route, vec!["fallback"]);

        settings.upstream.default_route.clear();
        let route = select_route(&settings, &request("m"), "chat", &["x".into(), "y".into()]);
        assert_eq!(route, vec!["x", "y"]);
    }

    // ── pick / retries ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pick_takes_first_in_list_order() {
        let sched = scheduler();
        sched.register(Arc::new(MockAdapter::new("b")));
        sched.register(Arc::new(MockAdapter::new("a")));
        let picked = sched
            .pick(&["b".into(), "a".into()], false, &HashSet::new())
            .unwrap();
        assert_eq!(picked.name(), "b");
    }

    #[tokio::test]
    async fn pick_skips_cooled_down_adapter() {
        let sched = scheduler();
        sched.register(Arc::new(MockAdapter::new("a")));
        sched.register(Arc::new(MockAdapter::new("b")));
        for _ in 0..3 {
            sched
                .registry
                .apply(HealthDelta::TransientFailure { adapter: "a".into() });
        }
        let picked = sched
            .pick(&["a".into(), "b".into()], false, &HashSet::new())
            .unwrap();
        assert_eq!(picked.name(), "b");
    }

    #[tokio::test]
    async fn pick_relaxes_probe_gate_when_not_strict() {
        let sched = scheduler();
        sched.register(Arc::new(MockAdapter::new("a")));
        sched.registry.apply(HealthDelta::ProbeResult {
            adapter: "a".into(),
            ok: false,
        });
        // Not strict: the failed probe is advisory, the adapter is used.
        let picked = sched.pick(&["a".into()], false, &HashSet::new()).unwrap();
        assert_eq!(picked.name(), "a");
        // Strict: nothing qualifies.
        let err = sched.pick(&["a".into()], true, &HashSet::new()).unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn retries_fail_over_to_next_adapter() {
        let sched = scheduler();
        sched.register(Arc::new(ScriptedAdapter::always_failing("bad")));
        sched.register(Arc::new(ScriptedAdapter::always_text("good", "saved")));
        let resp = sched
            .complete_with_retries(
                &["bad".into(), "good".into()],
                &request("m"),
                "m",
                1,
                false,
            )
            .await
            .unwrap();
        assert_eq!(resp.joined_text(), "saved");
    }

    #[tokio::test]
    async fn zero_retries_surfaces_upstream_unavailable() {
        let sched = scheduler();
        sched.register(Arc::new(ScriptedAdapter::always_failing("bad")));
        let err = sched
            .complete_with_retries(&["bad".into()], &request("m"), "m", 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn permanent_failure_propagates_immediately() {
        let sched = scheduler();
        let bad = ScriptedAdapter::new(
            "bad",
            vec![Err(AdapterError::Permanent("upstream returned 400".into()))],
        );
        sched.register(Arc::new(bad));
        sched.register(Arc::new(ScriptedAdapter::always_text("good", "unused")));
        let err = sched
            .complete_with_retries(
                &["bad".into(), "good".into()],
                &request("m"),
                "m",
                3,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn failing_adapter_reaches_cooldown_and_traffic_shifts() {
        let (registry, _) = HealthRegistry::new(2, Duration::from_secs(60));
        let sched = Scheduler::new(registry);
        sched.register(Arc::new(ScriptedAdapter::always_failing("flaky")));
        sched.register(Arc::new(ScriptedAdapter::new(
            "steady",
            (0..20)
                .map(|_| {
                    Ok(CanonicalResponse {
                        model: "m".into(),
                        blocks: vec![vaxel_wire::AssistantBlock::text("ok")],
                        stop_reason: vaxel_wire::StopReason::EndTurn,
                        usage: Default::default(),
                    })
                })
                .collect(),
        )));
        let route = vec!["flaky".to_string(), "steady".to_string()];
        for _ in 0..5 {
            let resp = sched
                .complete_with_retries(&route, &request("m"), "m", 2, false)
                .await
                .unwrap();
            assert_eq!(resp.joined_text(), "ok");
        }
        // After tripping the threshold the flaky adapter is in cooldown and
        // no longer even attempted.
        let snap = sched
            .registry
            .snapshot()
            .into_iter()
            .find(|s| s.adapter == "flaky")
            .unwrap();
        assert!(snap.cooldown_remaining_secs > 0);
        let flaky_calls_before = {
            let a = sched.get("flaky").unwrap();
            // count via pick: flaky must be skipped now
            drop(a);
            sched
                .pick(&route, false, &HashSet::new())
                .unwrap()
                .name()
                .to_string()
        };
        assert_eq!(flaky_calls_before, "steady");
    }

    #[tokio::test]
    async fn rebuild_from_settings_registers_mock_adapters() {
        use vaxel_settings::{AdapterSpec, CapabilityHints};
        let sched = scheduler();
        let mut settings = RuntimeSettings::default();
        settings.upstream.adapters.push(AdapterSpec {
            name: "m1".into(),
            kind: AdapterKind::Mock,
            base_url: None,
            api_key_env: None,
            extra_headers: vec![],
            capabilities: CapabilityHints::default(),
            script: None,
        });
        sched.rebuild_from_settings(&settings).unwrap();
        assert_eq!(sched.adapter_names(), vec!["m1"]);
        assert!(sched.get("m1").is_some());
    }
}
