// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Anthropic-dialect endpoints: `/v1/messages` and
//! `/v1/messages/count_tokens`.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use vaxel_wire::{anthropic, GatewayError};

use crate::{
    handlers::{client_ip, decode_failure, json_with_headers, pipeline_failure},
    pipeline::{self, Dialect},
    state::RuntimeContext,
};

pub async fn post_messages(
    State(state): State<Arc<RuntimeContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if headers.get("anthropic-version").is_none() {
        return decode_failure(
            &state,
            "/v1/messages",
            &headers,
            &body,
            GatewayError::InvalidRequest("missing anthropic-version header".into()),
        );
    }
    let req = match anthropic::decode_request(&body) {
        Ok(req) => req,
        Err(err) => return decode_failure(&state, "/v1/messages", &headers, &body, err),
    };
    let ip = client_ip(&headers, Some(addr.ip()));
    let (req, mut ctx) = match pipeline::prepare(&state, &headers, ip, req) {
        Ok(prepared) => prepared,
        Err(err) => return pipeline_failure(&state, None, err),
    };

    if req.stream {
        // Streaming failures are settled inside the pipeline; only the
        // envelope is rendered here.
        match pipeline::streaming_response(state.clone(), req, ctx, Dialect::Anthropic).await {
            Ok(resp) => resp,
            Err(err) => crate::error::ApiError(err).into_response(),
        }
    } else {
        match pipeline::execute(&state, req, &mut ctx).await {
            Ok(resp) => {
                let message_id = format!("msg_{}", ctx.run_id);
                let body = anthropic::encode_response(&resp, &ctx.client_model, &message_id);
                json_with_headers(&ctx, body)
            }
            Err(err) => pipeline_failure(&state, Some(&mut ctx), err),
        }
    }
}

/// 4-chars-per-token approximation over all text content, the same
/// heuristic the quota estimate uses.
pub async fn count_tokens(
    State(state): State<Arc<RuntimeContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = match anthropic::decode_request(&body) {
        Ok(req) => req,
        Err(err) => {
            return decode_failure(&state, "/v1/messages/count_tokens", &headers, &body, err)
        }
    };
    Json(json!({ "input_tokens": req.approx_input_tokens() })).into_response()
}
