// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod admin;
pub mod chat;
pub mod messages;
pub mod metrics;
pub mod observe;
pub mod responses_api;

use std::{net::IpAddr, sync::Arc};

use axum::{
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vaxel_events::{names, NewEvent};
use vaxel_wire::GatewayError;

use crate::{
    error::{redacted_curl, ApiError},
    pipeline::RequestContext,
    state::RuntimeContext,
};

/// Client address: `x-forwarded-for` wins over the socket peer so the
/// gateway keeps working behind a reverse proxy.
pub(crate) fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or(peer)
}

/// JSON response carrying the per-request gateway headers.
pub(crate) fn json_with_headers(ctx: &RequestContext, value: serde_json::Value) -> Response {
    let mut resp = Json(value).into_response();
    for (name, v) in ctx.response_headers() {
        if let Ok(v) = HeaderValue::from_str(&v) {
            resp.headers_mut().insert(name, v);
        }
    }
    resp
}

/// Record a dialect decode failure with its redacted reproduction, bump
/// the error counters, and render the public envelope.
pub(crate) fn decode_failure(
    state: &Arc<RuntimeContext>,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
    err: GatewayError,
) -> Response {
    state.events.append(
        NewEvent::new(names::REQUEST_DECODE_FAILED).with_data(json!({
            "path": path,
            "error": err.to_string(),
            "curl_command": redacted_curl("POST", path, headers, body),
        })),
    );
    state.metrics.record_error(err.kind());
    ApiError(err).into_response()
}

/// Render a pipeline failure: bookkeeping plus the public envelope.
pub(crate) fn pipeline_failure(
    state: &Arc<RuntimeContext>,
    ctx: Option<&mut RequestContext>,
    err: GatewayError,
) -> Response {
    crate::pipeline::fail(state, ctx, &err);
    ApiError(err).into_response()
}
