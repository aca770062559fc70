// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Public error taxonomy and the wire envelope.
//!
//! Every internal failure is translated into exactly one of these kinds at
//! the HTTP boundary; the original message is retained for events and admin
//! diagnostics but raw upstream bodies are summarised before they get here.

use serde_json::{json, Value};
use thiserror::Error;

/// The public error taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Dialect decode failures, missing headers, unknown admin fields.
    #[error("{0}")]
    InvalidRequest(String),
    /// Missing or unknown bearer token.
    #[error("{0}")]
    Auth(String),
    /// Known principal, forbidden operation (model allowlist, subnet).
    #[error("{0}")]
    Permission(String),
    /// No such resource on an admin or observability path.
    #[error("{0}")]
    NotFound(String),
    /// Reservation failed at pre-reserve time.
    #[error("{0}")]
    Quota(String),
    /// Token bucket exhausted.
    #[error("{0}")]
    RateLimited(String),
    /// All eligible adapters failed or none were eligible.
    #[error("{0}")]
    UpstreamUnavailable(String),
    /// Invariant violation; always a bug.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// The `error.type` discriminator on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::Auth(_) => "auth_error",
            Self::Permission(_) => "permission_error",
            Self::NotFound(_) => "not_found_error",
            Self::Quota(_) => "quota_error",
            Self::RateLimited(_) => "rate_limited",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this kind.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Auth(_) => 401,
            Self::Permission(_) => 403,
            Self::Quota(_) => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited(_) => 429,
            Self::UpstreamUnavailable(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// The public JSON envelope: `{"type":"error","error":{...}}`.
    pub fn to_envelope(&self) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        })
    }

    /// True for failures worth retrying on another adapter.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        let cases = [
            (GatewayError::InvalidRequest("x".into()), 400),
            (GatewayError::Auth("x".into()), 401),
            (GatewayError::Permission("x".into()), 403),
            (GatewayError::Quota("x".into()), 403),
            (GatewayError::NotFound("x".into()), 404),
            (GatewayError::RateLimited("x".into()), 429),
            (GatewayError::UpstreamUnavailable("x".into()), 502),
            (GatewayError::Internal("x".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "wrong status for {}", err.kind());
        }
    }

    #[test]
    fn envelope_has_type_error_shape() {
        let env = GatewayError::Quota("quota exhausted".into()).to_envelope();
        assert_eq!(env["type"], "error");
        assert_eq!(env["error"]["type"], "quota_error");
        assert_eq!(env["error"]["message"], "quota exhausted");
    }

    #[test]
    fn only_upstream_unavailable_is_transient() {
        assert!(GatewayError::UpstreamUnavailable("x".into()).is_transient());
        assert!(!GatewayError::InvalidRequest("x".into()).is_transient());
        assert!(!GatewayError::Internal("x".into()).is_transient());
    }
}
