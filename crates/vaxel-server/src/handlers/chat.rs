// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The OpenAI chat.completions endpoint: `/v1/chat/completions`.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use vaxel_wire::openai;

use crate::{
    handlers::{client_ip, decode_failure, json_with_headers, pipeline_failure},
    pipeline::{self, Dialect},
    state::RuntimeContext,
};

pub async fn post_chat_completions(
    State(state): State<Arc<RuntimeContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req = match openai::decode_request(&body) {
        Ok(req) => req,
        Err(err) => return decode_failure(&state, "/v1/chat/completions", &headers, &body, err),
    };
    let ip = client_ip(&headers, Some(addr.ip()));
    let (req, mut ctx) = match pipeline::prepare(&state, &headers, ip, req) {
        Ok(prepared) => prepared,
        Err(err) => return pipeline_failure(&state, None, err),
    };

    if req.stream {
        match pipeline::streaming_response(state.clone(), req, ctx, Dialect::OpenAiChat).await {
            Ok(resp) => resp,
            Err(err) => crate::error::ApiError(err).into_response(),
        }
    } else {
        match pipeline::execute(&state, req, &mut ctx).await {
            Ok(resp) => {
                let id = format!("chatcmpl_{}", ctx.run_id);
                let created = chrono::Utc::now().timestamp();
                let body = openai::encode_response(&resp, &ctx.client_model, &id, created);
                json_with_headers(&ctx, body)
            }
            Err(err) => pipeline_failure(&state, Some(&mut ctx), err),
        }
    }
}
