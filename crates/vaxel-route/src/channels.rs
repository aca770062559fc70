// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Channels and the derived ability index.
//!
//! A channel advertises `(group, models, priority, status)`. The store
//! derives an index keyed `group:model → channel id` so group-based
//! routing is one hash lookup on the hot path; the index is rebuilt on any
//! mutation rather than patched, which keeps the rebuild trivially correct.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: u64,
    pub group: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: ChannelStatus,
}

#[derive(Default)]
pub struct ChannelStore {
    channels: RwLock<HashMap<u64, Channel>>,
    ability: RwLock<HashMap<String, u64>>,
    next_id: AtomicU64,
}

fn ability_key(group: &str, model: &str) -> String {
    format!("{group}:{model}")
}

impl ChannelStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn create(
        &self,
        group: impl Into<String>,
        models: Vec<String>,
        priority: i32,
        status: ChannelStatus,
    ) -> Channel {
        let channel = Channel {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            group: group.into(),
            models,
            priority,
            status,
        };
        self.channels
            .write()
            .expect("channel lock poisoned")
            .insert(channel.id, channel.clone());
        self.rebuild();
        channel
    }

    /// Replace an existing channel; `false` when the id is unknown.
    pub fn update(&self, channel: Channel) -> bool {
        let mut channels = self.channels.write().expect("channel lock poisoned");
        if !channels.contains_key(&channel.id) {
            return false;
        }
        channels.insert(channel.id, channel);
        drop(channels);
        self.rebuild();
        true
    }

    pub fn delete(&self, id: u64) -> bool {
        let removed = self
            .channels
            .write()
            .expect("channel lock poisoned")
            .remove(&id)
            .is_some();
        if removed {
            self.rebuild();
        }
        removed
    }

    pub fn list(&self) -> Vec<Channel> {
        let mut list: Vec<Channel> = self
            .channels
            .read()
            .expect("channel lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    pub fn get(&self, id: u64) -> Option<Channel> {
        self.channels
            .read()
            .expect("channel lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Ability lookup: the winning channel for `(group, model)`.
    pub fn lookup(&self, group: &str, model: &str) -> Option<u64> {
        self.ability
            .read()
            .expect("ability lock poisoned")
            .get(&ability_key(group, model))
            .copied()
    }

    pub fn ability_len(&self) -> usize {
        self.ability.read().expect("ability lock poisoned").len()
    }

    /// Rebuild the whole index. Highest priority wins per key; ties go to
    /// the lowest channel id for determinism.
    fn rebuild(&self) {
        let channels = self.channels.read().expect("channel lock poisoned");
        let mut index: HashMap<String, u64> = HashMap::new();
        for channel in channels.values() {
            if channel.status != ChannelStatus::Enabled {
                continue;
            }
            for model in &channel.models {
                let key = ability_key(&channel.group, model);
                match index.get(&key) {
                    Some(existing) => {
                        let current = &channels[existing];
                        if channel.priority > current.priority
                            || (channel.priority == current.priority
                                && channel.id < current.id)
                        {
                            index.insert(key, channel.id);
                        }
                    }
                    None => {
                        index.insert(key, channel.id);
                    }
                }
            }
        }
        debug!(entries = index.len(), "rebuilt ability index");
        *self.ability.write().expect("ability lock poisoned") = index;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
