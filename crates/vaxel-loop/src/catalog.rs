// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The local tool catalog and the in-process executor interface.
//!
//! The catalog decides which tool names the server-side loop may execute
//! locally; the actual execution lives behind [`ToolExecutor`], supplied by
//! the embedding application.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    #[default]
    Supported,
    Experimental,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ToolStatus,
}

/// Executes a locally known tool. Errors are represented in-band as
/// `(message, is_error = true)` so the loop can keep going.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(&self, name: &str, input: &Value) -> (String, bool);
}

#[derive(Default)]
pub struct ToolCatalog {
    entries: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `TOOL_CATALOG_JSON` payload: an array of entries.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let entries: Vec<ToolEntry> = serde_json::from_str(raw)?;
        let catalog = Self::new();
        for entry in entries {
            catalog.upsert(entry);
        }
        Ok(catalog)
    }

    pub fn upsert(&self, entry: ToolEntry) {
        self.entries
            .write()
            .expect("catalog lock poisoned")
            .insert(entry.name.clone(), entry);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries
            .write()
            .expect("catalog lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<ToolEntry> {
        self.entries
            .read()
            .expect("catalog lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("catalog lock poisoned")
            .contains_key(name)
    }

    pub fn list(&self) -> Vec<ToolEntry> {
        let mut list: Vec<ToolEntry> = self
            .entries
            .read()
            .expect("catalog lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Whether the loop may run this tool in-process.
    pub fn executable(&self, name: &str, allow_experimental: bool) -> bool {
        match self.get(name) {
            Some(entry) => match entry.status {
                ToolStatus::Supported => true,
                ToolStatus::Experimental => allow_experimental,
                ToolStatus::Unsupported => false,
            },
            None => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
