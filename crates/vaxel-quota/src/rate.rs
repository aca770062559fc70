// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-key token-bucket rate limiting.
//!
//! Uses the `governor` crate (GCRA algorithm) keyed by an arbitrary string
//! — the bearer token when one is presented, the client address otherwise.

use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter,
};
use vaxel_wire::GatewayError;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

pub struct RateGate {
    limiter: KeyedLimiter,
    rps: u32,
    burst: u32,
}

impl RateGate {
    /// `rps` sustained requests per second with up to `burst` allowed in a
    /// burst. Zero values are lifted to 1 — a zero quota would panic in
    /// governor and "no traffic at all" is never what an operator means.
    pub fn new(rps: u32, burst: u32) -> Self {
        let rps = rps.max(1);
        let burst = burst.max(1);
        let quota = Quota::per_second(NonZeroU32::new(rps).expect("rps > 0"))
            .allow_burst(NonZeroU32::new(burst).expect("burst > 0"));
        Self {
            limiter: RateLimiter::keyed(quota),
            rps,
            burst,
        }
    }

    /// One bucket check; `Err(rate_limited)` when the key is exhausted.
    pub fn check(&self, key: &str) -> Result<(), GatewayError> {
        self.limiter
            .check_key(&key.to_string())
            .map_err(|_| GatewayError::RateLimited("rate limit exceeded".into()))
    }

    pub fn rps(&self) -> u32 {
        self.rps
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
