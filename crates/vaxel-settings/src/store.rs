// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::RwLock;

use crate::schema::RuntimeSettings;

/// Process-wide settings behind a reader-writer lock.
///
/// `get` hands out a deep clone so request handlers work against an
/// immutable snapshot; a concurrent `put` never changes a request half-way
/// through its pipeline.
#[derive(Default)]
pub struct SettingsStore {
    inner: RwLock<RuntimeSettings>,
}

impl SettingsStore {
    pub fn new(mut initial: RuntimeSettings) -> Self {
        initial.sanitize();
        Self {
            inner: RwLock::new(initial),
        }
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> RuntimeSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Replace the settings after sanitisation; returns the value actually
    /// stored.
    pub fn put(&self, mut settings: RuntimeSettings) -> RuntimeSettings {
        settings.sanitize();
        let mut guard = self.inner.write().expect("settings lock poisoned");
        *guard = settings.clone();
        settings
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_independent_clone() {
        let store = SettingsStore::default();
        let mut snap = store.get();
        snap.model_map_strict = true;
        assert!(!store.get().model_map_strict, "snapshot must not leak back");
    }

    #[test]
    fn put_sanitizes_before_storing() {
        let store = SettingsStore::default();
        let mut s = RuntimeSettings::default();
        s.routing.timeout_ms = 0;
        let stored = store.put(s);
        assert_eq!(stored.routing.timeout_ms, 30_000);
        assert_eq!(store.get().routing.timeout_ms, 30_000);
    }

    #[test]
    fn new_sanitizes_initial_value() {
        let mut s = RuntimeSettings::default();
        s.tool_loop.max_steps = 0;
        let store = SettingsStore::new(s);
        assert_eq!(store.get().tool_loop.max_steps, 4);
    }
}
