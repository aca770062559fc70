// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use vaxel_settings::{AdapterKind, CapabilityHints};
use vaxel_wire::{CanonicalRequest, CanonicalResponse, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, AdapterError>> + Send>>;

/// Failure of one upstream call, pre-classified for the scheduler.
///
/// Transient failures (timeouts, 5xx, connection resets, 408/429) count
/// toward the adapter's failure threshold and are retried on the next
/// eligible adapter; permanent failures are request-level errors forwarded
/// to the caller without touching adapter health.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl AdapterError {
    /// Classify an HTTP response status. The body is summarised to its
    /// first line so raw upstream payloads never propagate verbatim.
    pub fn from_status(status: u16, body: &str) -> Self {
        let summary = body.lines().next().unwrap_or("").chars().take(200).collect::<String>();
        let msg = format!("upstream returned {status}: {summary}");
        match status {
            408 | 429 => Self::Transient(msg),
            s if s >= 500 => Self::Transient(msg),
            _ => Self::Permanent(msg),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        // Network-level failures (connect, timeout, reset) are all
        // transient by definition.
        Self::Transient(format!("upstream request failed: {e}"))
    }
}

/// One configured upstream endpoint.
///
/// `complete` and `stream` receive the canonical request plus the already
/// mapped upstream model name; adapters never consult the mapping table
/// themselves.
impl std::fmt::Debug for dyn UpstreamAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamAdapter").field("name", &self.name()).finish()
    }
}

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    /// Unique adapter name from the settings value.
    fn name(&self) -> &str;

    /// Wire dialect this adapter speaks; drives pass-through streaming.
    fn kind(&self) -> AdapterKind;

    /// Capability hints; `None` fields mean unknown.
    fn capabilities(&self) -> CapabilityHints;

    /// One non-streaming completion.
    async fn complete(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<CanonicalResponse, AdapterError>;

    /// Streaming completion. Events are pass-through payloads in this
    /// adapter's own dialect; the dialect encoder decides whether they can
    /// be forwarded raw.
    async fn stream(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<EventStream, AdapterError>;
}

// ─── Kind registry ────────────────────────────────────────────────────────────

/// Static metadata for each adapter kind, surfaced by `/admin/upstream`.
#[derive(Debug, Clone)]
pub struct AdapterKindMeta {
    pub kind: AdapterKind,
    pub name: &'static str,
    pub description: &'static str,
    /// Default environment variable holding the API key, when one applies.
    pub default_api_key_env: Option<&'static str>,
    pub default_base_url: Option<&'static str>,
}

pub static ADAPTER_KINDS: &[AdapterKindMeta] = &[
    AdapterKindMeta {
        kind: AdapterKind::Openai,
        name: "OpenAI-compatible",
        description: "Any endpoint speaking the /chat/completions wire format",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
    },
    AdapterKindMeta {
        kind: AdapterKind::Anthropic,
        name: "Anthropic-compatible",
        description: "Any endpoint speaking the /v1/messages wire format",
        default_api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
    },
    AdapterKindMeta {
        kind: AdapterKind::Mock,
        name: "Mock",
        description: "Deterministic echo adapter for tests (no network)",
        default_api_key_env: None,
        default_base_url: None,
    },
    AdapterKindMeta {
        kind: AdapterKind::Script,
        name: "Scripted",
        description: "Pre-scripted responses from the adapter spec",
        default_api_key_env: None,
        default_base_url: None,
    },
];

pub fn kind_meta(kind: AdapterKind) -> &'static AdapterKindMeta {
    ADAPTER_KINDS
        .iter()
        .find(|m| m.kind == kind)
        .expect("every kind is registered")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_5xx_is_transient() {
        assert!(AdapterError::from_status(500, "boom").is_transient());
        assert!(AdapterError::from_status(503, "").is_transient());
    }

    #[test]
    fn status_408_and_429_are_transient() {
        assert!(AdapterError::from_status(408, "").is_transient());
        assert!(AdapterError::from_status(429, "").is_transient());
    }

    #[test]
    fn other_4xx_is_permanent() {
        assert!(!AdapterError::from_status(400, "bad request").is_transient());
        assert!(!AdapterError::from_status(404, "").is_transient());
        assert!(!AdapterError::from_status(422, "").is_transient());
    }

    #[test]
    fn body_is_summarised_to_first_line() {
        let err = AdapterError::from_status(500, "line one\nsecret line two");
        assert!(err.to_string().contains("line one"));
        assert!(!err.to_string().contains("secret line two"));
    }

    #[test]
    fn every_kind_has_meta() {
        for kind in [
            AdapterKind::Openai,
            AdapterKind::Anthropic,
            AdapterKind::Mock,
            AdapterKind::Script,
        ] {
            assert_eq!(kind_meta(kind).kind, kind);
        }
    }
}
