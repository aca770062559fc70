// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Anthropic-compatible upstream driver (`/v1/messages` wire format).

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;
use vaxel_settings::{AdapterKind, AdapterSpec, CapabilityHints};
use vaxel_wire::{anthropic, CanonicalRequest, CanonicalResponse, StreamEvent};

use crate::{
    adapter::{AdapterError, EventStream, UpstreamAdapter},
    sse::SseBuffer,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicUpstream {
    name: String,
    messages_url: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
    capabilities: CapabilityHints,
    client: reqwest::Client,
}

impl AnthropicUpstream {
    pub fn from_spec(spec: &AdapterSpec) -> Self {
        let base = spec
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com")
            .trim_end_matches('/');
        let api_key = spec
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self {
            name: spec.name.clone(),
            messages_url: format!("{base}/v1/messages"),
            api_key,
            extra_headers: spec.extra_headers.clone(),
            capabilities: spec.capabilities,
            client: reqwest::Client::new(),
        }
    }

    async fn send(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
        stream: bool,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut body = anthropic::build_request_body(req, upstream_model);
        body["stream"] = serde_json::json!(stream);
        debug!(adapter = %self.name, model = %upstream_model, stream, "sending anthropic request");
        let mut builder = self
            .client
            .post(&self.messages_url)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        let resp = builder.json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl UpstreamAdapter for AnthropicUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Anthropic
    }

    fn capabilities(&self) -> CapabilityHints {
        self.capabilities
    }

    async fn complete(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<CanonicalResponse, AdapterError> {
        let resp = self.send(req, upstream_model, false).await?;
        let value: serde_json::Value = resp.json().await?;
        anthropic::decode_response(&value)
            .map_err(|e| AdapterError::Permanent(format!("bad upstream response: {e}")))
    }

    async fn stream(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
    ) -> Result<EventStream, AdapterError> {
        let resp = self.send(req, upstream_model, true).await?;
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(SseBuffer::new(), |buf, chunk| {
                let events: Vec<Result<StreamEvent, AdapterError>> = match chunk {
                    Ok(bytes) => buf
                        .push(&bytes)
                        .into_iter()
                        .map(|p| {
                            Ok(StreamEvent::Passthrough {
                                event: p.event,
                                raw: p.data,
                            })
                        })
                        .collect(),
                    Err(e) => vec![Err(AdapterError::from(e))],
                };
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(event_stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
