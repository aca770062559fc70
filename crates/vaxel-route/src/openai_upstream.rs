// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible upstream driver.
//!
//! Speaks the `/chat/completions` wire format over reqwest. One driver
//! covers every endpoint in this family; the spec only varies the base
//! URL, key, and extra headers.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;
use vaxel_settings::{AdapterKind, AdapterSpec, CapabilityHints};
use vaxel_wire::{openai, CanonicalRequest, CanonicalResponse, StreamEvent};

use crate::{
    adapter::{AdapterError, EventStream, UpstreamAdapter},
    sse::SseBuffer,
};

pub struct OpenAiUpstream {
    name: String,
    chat_url: String,
    api_key: Option<String>,
    extra_headers: Vec<(String, String)>,
    capabilities: CapabilityHints,
    client: reqwest::Client,
}

impl OpenAiUpstream {
    pub fn from_spec(spec: &AdapterSpec) -> Self {
        let base = spec
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');
        let api_key = spec
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self {
            name: spec.name.clone(),
            chat_url: format!("{base}/chat/completions"),
            api_key,
            extra_headers: spec.extra_headers.clone(),
            capabilities: spec.capabilities,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(&self.chat_url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }
        builder.json(body)
    }

    async fn send(
        &self,
        req: &CanonicalRequest,
        upstream_model: &str,
        stream: bool,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut body = openai::build_request_body(req, upstream_model);
        body["stream"] = serde_json::json!(stream);
        debug!(adapter = %self.name, model = %upstream_model, stream, "sending openai request");
        let resp = self.request(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, &text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl UpstreamAdapter for OpenAiUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Openai
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
        openai::decode_response(&value)
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
                        .filter(|p| p.data != b"[DONE]")
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
