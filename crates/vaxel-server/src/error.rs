// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP rendering of the public error envelope, plus the redacted `curl`
//! reproduction attached to decode-failure events.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use vaxel_wire::GatewayError;

/// Newtype so `GatewayError` can travel through axum as a rejection.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_envelope())).into_response()
    }
}

/// Headers whose values never appear in diagnostics.
fn is_sensitive(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered == "authorization"
        || lowered == "cookie"
        || (lowered.starts_with("x-") && lowered.ends_with("-token"))
}

/// Build a `curl` command reproducing the failed request, with credential
/// headers replaced by `[REDACTED]`. Attached to `request.decode_failed`
/// and `request.unsupported_fields` events so operators can replay a bad
/// request without ever logging a secret.
pub fn redacted_curl(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) -> String {
    let mut parts = vec![format!("curl -X {method} '{path}'")];
    let mut names: Vec<&str> = headers.keys().map(|k| k.as_str()).collect();
    names.sort_unstable();
    for name in names {
        let value = if is_sensitive(name) {
            "[REDACTED]".to_string()
        } else {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("[non-ascii]")
                .to_string()
        };
        parts.push(format!("-H '{name}: {value}'"));
    }
    if !body.is_empty() {
        let body = String::from_utf8_lossy(body);
        let body = body.replace('\'', "'\\''");
        parts.push(format!("-d '{body}'"));
    }
    parts.join(" \\\n  ")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
