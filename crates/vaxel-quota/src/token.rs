// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bearer tokens and the three-phase quota protocol.
//!
//! Every request that presents a token goes through
//! `pre_reserve → commit | cancel`. The reservation subtracts an estimate up
//! front so 100 concurrent requests against one token cannot collectively
//! overdraw it; commit settles against actual usage and refunds the excess.
//! Settlement is at-most-once per request id — a duplicate commit or cancel
//! is rejected, never double-counted.
//!
//! Each token sits behind its own mutex; the outer map is only locked to
//! find the entry, so contention on one hot token never blocks others.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Mutex, RwLock},
};

use serde::{Deserialize, Serialize};
use vaxel_wire::GatewayError;

use crate::token::subnet::subnet_allows;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    #[default]
    Active,
    Disabled,
    Expired,
}

/// One issued bearer token and its quota bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    /// The opaque bearer value presented by clients.
    pub value: String,
    pub user_id: String,
    /// Total budget in tokens; 0 means unlimited.
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub used: i64,
    #[serde(default)]
    pub status: TokenStatus,
    /// Models this token may request; empty allows all.
    #[serde(default)]
    pub models: Vec<String>,
    /// CIDR (`10.0.0.0/8`) or plain address the client must come from.
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

impl Token {
    pub fn new(value: impl Into<String>, user_id: impl Into<String>, quota: i64) -> Self {
        Self {
            value: value.into(),
            user_id: user_id.into(),
            quota,
            used: 0,
            status: TokenStatus::Active,
            models: Vec::new(),
            subnet: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn unlimited(&self) -> bool {
        self.quota == 0
    }

    fn remaining(&self) -> i64 {
        self.quota - self.used
    }
}

/// An administrative principal; tokens hang off users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

/// Outcome of `pre_reserve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Ok,
    InsufficientQuota,
    Disabled,
    Expired,
}

#[derive(Default, Debug)]
pub struct TokenService {
    users: RwLock<HashMap<String, User>>,
    tokens: RwLock<HashMap<String, Arc<Mutex<Token>>>>,
    /// Request ids already settled by commit or cancel.
    settled: Mutex<HashSet<String>>,
}

impl TokenService {
    pub fn new() -> Self {
        Self::default()
    }

    // ── User CRUD ─────────────────────────────────────────────────────────────

    pub fn create_user(&self, name: impl Into<String>) -> User {
        let user = User {
            id: format!("user_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.users
            .write()
            .expect("user lock poisoned")
            .insert(user.id.clone(), user.clone());
        user
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .read()
            .expect("user lock poisoned")
            .values()
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn get_user(&self, id: &str) -> Option<User> {
        self.users.read().expect("user lock poisoned").get(id).cloned()
    }

    /// Deleting a user also deletes their tokens.
    pub fn delete_user(&self, id: &str) -> bool {
        let removed = self
            .users
            .write()
            .expect("user lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            self.tokens
                .write()
                .expect("token lock poisoned")
                .retain(|_, t| t.lock().expect("token poisoned").user_id != id);
        }
        removed
    }

    // ── Token CRUD ────────────────────────────────────────────────────────────

    pub fn insert_token(&self, token: Token) {
        self.tokens
            .write()
            .expect("token lock poisoned")
            .insert(token.value.clone(), Arc::new(Mutex::new(token)));
    }

    /// Mint a fresh token for `user_id` with the given quota.
    pub fn create_token(&self, user_id: &str, quota: i64) -> Result<Token, GatewayError> {
        if self.get_user(user_id).is_none() {
            return Err(GatewayError::NotFound(format!("no user {user_id:?}")));
        }
        let token = Token::new(
            format!("vx_{}", uuid::Uuid::new_v4().simple()),
            user_id,
            quota,
        );
        self.insert_token(token.clone());
        Ok(token)
    }

    pub fn list_tokens(&self, user_id: &str) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .tokens
            .read()
            .expect("token lock poisoned")
            .values()
            .map(|t| t.lock().expect("token poisoned").clone())
            .filter(|t| t.user_id == user_id)
            .collect();
        tokens.sort_by(|a, b| a.value.cmp(&b.value));
        tokens
    }

    pub fn delete_token(&self, value: &str) -> bool {
        self.tokens
            .write()
            .expect("token lock poisoned")
            .remove(value)
            .is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().expect("token lock poisoned").is_empty()
    }

    fn entry(&self, value: &str) -> Option<Arc<Mutex<Token>>> {
        self.tokens
            .read()
            .expect("token lock poisoned")
            .get(value)
            .cloned()
    }

    // ── Authorization ─────────────────────────────────────────────────────────

    /// Check the bearer value, client address, and requested model; returns
    /// the owning user id.
    pub fn authorize(
        &self,
        value: &str,
        client_ip: Option<IpAddr>,
        model: &str,
    ) -> Result<String, GatewayError> {
        let entry = self
            .entry(value)
            .ok_or_else(|| GatewayError::Auth("unknown token".into()))?;
        let token = entry.lock().expect("token poisoned");
        match token.status {
            TokenStatus::Active => {}
            TokenStatus::Disabled => {
                return Err(GatewayError::Auth("token disabled".into()))
            }
            TokenStatus::Expired => return Err(GatewayError::Auth("token expired".into())),
        }
        if let Some(subnet) = &token.subnet {
            let ip = client_ip
                .ok_or_else(|| GatewayError::Permission("client address unknown".into()))?;
            if !subnet_allows(subnet, ip) {
                return Err(GatewayError::Permission(format!(
                    "client address {ip} not allowed for this token"
                )));
            }
        }
        if !token.models.is_empty()
            && !token
                .models
                .iter()
                .any(|m| model_glob_match(m, model))
        {
            return Err(GatewayError::Permission(format!(
                "model {model:?} not allowed for this token"
            )));
        }
        Ok(token.user_id.clone())
    }

    // ── Reservation protocol ──────────────────────────────────────────────────

    /// Reserve `amount` tokens up front. `amount` is clamped to at least 1.
    pub fn pre_reserve(&self, value: &str, amount: i64) -> ReserveOutcome {
        let amount = amount.max(1);
        let Some(entry) = self.entry(value) else {
            return ReserveOutcome::Disabled;
        };
        let mut token = entry.lock().expect("token poisoned");
        match token.status {
            TokenStatus::Disabled => return ReserveOutcome::Disabled,
            TokenStatus::Expired => return ReserveOutcome::Expired,
            TokenStatus::Active => {}
        }
        if token.unlimited() {
            token.used += amount;
            return ReserveOutcome::Ok;
        }
        if token.remaining() < amount {
            return ReserveOutcome::InsufficientQuota;
        }
        token.used += amount;
        ReserveOutcome::Ok
    }

    /// Settle a reservation against actual usage, refunding the excess.
    /// Returns `false` when `request_id` was already settled.
    pub fn commit(&self, value: &str, amount: i64, actual: i64, request_id: &str) -> bool {
        if !self.mark_settled(request_id) {
            return false;
        }
        let amount = amount.max(1);
        let Some(entry) = self.entry(value) else {
            return true; // token deleted mid-flight; nothing to settle
        };
        let mut token = entry.lock().expect("token poisoned");
        if actual < amount {
            token.used -= amount - actual;
        } else {
            token.used += actual - amount;
            if !token.unlimited() && token.used > token.quota {
                token.used = token.quota;
            }
        }
        if token.used < 0 {
            token.used = 0;
        }
        true
    }

    /// Return the whole reservation (error before dispatch, or request
    /// cancelled). Returns `false` when `request_id` was already settled.
    pub fn cancel(&self, value: &str, amount: i64, request_id: &str) -> bool {
        if !self.mark_settled(request_id) {
            return false;
        }
        let amount = amount.max(1);
        if let Some(entry) = self.entry(value) {
            let mut token = entry.lock().expect("token poisoned");
            token.used -= amount;
            if token.used < 0 {
                token.used = 0;
            }
        }
        true
    }

    fn mark_settled(&self, request_id: &str) -> bool {
        self.settled
            .lock()
            .expect("settled lock poisoned")
            .insert(request_id.to_string())
    }

    /// Current state of one token (admin view).
    pub fn get_token(&self, value: &str) -> Option<Token> {
        self.entry(value).map(|t| t.lock().expect("token poisoned").clone())
    }
}

/// Minimal glob for the model allowlist: `*` matches any run of characters.
fn model_glob_match(pattern: &str, name: &str) -> bool {
    // Single-star fast path covers allowlists in practice.
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        name.len() >= prefix.len() + suffix.len()
            && name.starts_with(prefix)
            && name.ends_with(suffix)
    } else {
        pattern == name
    }
}

mod subnet {
    use std::net::IpAddr;

    /// `10.0.0.0/8`-style IPv4 prefixes plus plain-address equality for
    /// both families.
    pub fn subnet_allows(subnet: &str, ip: IpAddr) -> bool {
        if let Some((base, len)) = subnet.split_once('/') {
            let (Ok(base), Ok(len)) = (base.parse::<IpAddr>(), len.parse::<u32>()) else {
                return false;
            };
            match (base, ip) {
                (IpAddr::V4(base), IpAddr::V4(ip)) => {
                    if len == 0 {
                        return true;
                    }
                    if len > 32 {
                        return false;
                    }
                    let mask = u32::MAX << (32 - len);
                    (u32::from(base) & mask) == (u32::from(ip) & mask)
                }
                (IpAddr::V6(base), IpAddr::V6(ip)) => {
                    if len == 0 {
                        return true;
                    }
                    if len > 128 {
                        return false;
                    }
                    let mask = u128::MAX << (128 - len);
                    (u128::from(base) & mask) == (u128::from(ip) & mask)
                }
                _ => false,
            }
        } else {
            subnet.parse::<IpAddr>().map(|s| s == ip).unwrap_or(false)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
