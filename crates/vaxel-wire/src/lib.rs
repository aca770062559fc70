// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Canonical request/response model and the public dialect translators.
//!
//! Both public dialects (Anthropic `/v1/messages`, OpenAI
//! `/v1/chat/completions` and `/v1/responses`) map to and from the single
//! [`CanonicalRequest`]/[`CanonicalResponse`] shape defined in
//! [`canonical`]. The translators are pure functions over request and
//! response values; nothing in this crate touches the network.

pub mod anthropic;
pub mod canonical;
pub mod error;
pub mod openai;
pub mod responses;
pub mod stream;

pub use canonical::{
    AssistantBlock, CanonicalRequest, CanonicalResponse, ContentBlock, Message, MessageContent,
    RequestMetadata, Role, StopReason, SystemPrompt, ToolSpec, Usage,
};
pub use error::GatewayError;
pub use stream::{BlockDelta, StreamEvent};

/// Parse exactly one JSON value from `body`, rejecting trailing garbage.
///
/// Public dialects accept unknown fields but must not silently swallow a
/// second JSON document concatenated after the first.
pub fn from_json_strict_single<T: serde::de::DeserializeOwned>(
    body: &[u8],
) -> Result<T, GatewayError> {
    let mut de = serde_json::Deserializer::from_slice(body);
    let value = T::deserialize(&mut de)
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid JSON body: {e}")))?;
    de.end()
        .map_err(|_| GatewayError::InvalidRequest("trailing data after JSON body".into()))?;
    Ok(value)
}
