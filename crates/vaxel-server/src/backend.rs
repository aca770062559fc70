// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The pluggable key-value backend.
//!
//! The core persists nothing on its own; sessions, todos, plans, teams,
//! plugins, skills, and subagent records all live behind this interface.
//! The in-memory implementation here is the default and the test double;
//! real storage drivers implement the same trait outside the core.

use std::{collections::BTreeMap, sync::RwLock};

use serde_json::Value;

pub trait Backend: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>);
    fn delete(&self, key: &str) -> bool;
    /// All keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Vec<String>;
    fn close(&self) {}
}

#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().expect("backend lock poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        self.data
            .write()
            .expect("backend lock poisoned")
            .insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.data
            .write()
            .expect("backend lock poisoned")
            .remove(key)
            .is_some()
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        self.data
            .read()
            .expect("backend lock poisoned")
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Read every JSON value stored under `prefix`. Non-JSON values are
/// skipped; the read surface never fails on a malformed record.
pub fn list_json(backend: &dyn Backend, prefix: &str) -> Vec<Value> {
    backend
        .list(prefix)
        .into_iter()
        .filter_map(|key| backend.get(&key))
        .filter_map(|bytes| serde_json::from_slice(&bytes).ok())
        .collect()
}

/// Store one JSON record under `prefix` + `id`.
pub fn put_json(backend: &dyn Backend, prefix: &str, id: &str, value: &Value) {
    backend.set(&format!("{prefix}{id}"), value.to_string().into_bytes());
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn set_get_delete_round_trip() {
        let b = MemoryBackend::new();
        b.set("k", b"v".to_vec());
        assert_eq!(b.get("k"), Some(b"v".to_vec()));
        assert!(b.delete("k"));
        assert!(b.get("k").is_none());
        assert!(!b.delete("k"));
    }

    #[test]
    fn list_returns_only_prefix_matches_sorted() {
        let b = MemoryBackend::new();
        b.set("session/2", vec![]);
        b.set("session/1", vec![]);
        b.set("todo/1", vec![]);
        assert_eq!(b.list("session/"), vec!["session/1", "session/2"]);
    }

    #[test]
    fn list_json_skips_malformed_records() {
        let b = MemoryBackend::new();
        put_json(&b, "plan/", "1", &json!({"id": "1"}));
        b.set("plan/2", b"not json".to_vec());
        let plans = list_json(&b, "plan/");
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0]["id"], "1");
    }
}
