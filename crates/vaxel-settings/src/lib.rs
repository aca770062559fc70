// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod env;
pub mod mapping;
pub mod schema;
pub mod store;

pub use mapping::{glob_match, resolve_model};
pub use schema::{
    AdapterKind, AdapterSpec, CapabilityHints, EmulationMode, ProbeSettings, RateLimitSettings,
    RoutingSettings, RuntimeSettings, ToolLoopMode, ToolLoopSettings, UpstreamSettings,
};
pub use store::SettingsStore;
