// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! MCP fallback: externally registered tool providers addressed by
//! JSON-RPC (`tools/list`, `tools/call`).
//!
//! The registry caches each server's tool listing with a TTL so the loop
//! does not hammer `tools/list` on every call, and walks the servers in
//! registration order until one handles the tool. A `tool not found` from
//! one server just moves on to the next.

use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
}

/// Why a `tools/call` did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub enum McpCallError {
    /// The server does not know this tool; try the next server.
    ToolNotFound,
    /// Transport or protocol failure.
    Failed(String),
}

#[async_trait]
pub trait McpServer: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap liveness check for the observability API.
    async fn health(&self) -> bool;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpCallError>;

    /// Invoke one tool; the result is `(content, is_error)`.
    async fn call_tool(&self, name: &str, args: &Value) -> Result<(String, bool), McpCallError>;
}

// ─── HTTP JSON-RPC client ─────────────────────────────────────────────────────

pub struct HttpMcpServer {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMcpServer {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, McpCallError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| McpCallError::Failed(format!("mcp request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpCallError::Failed(format!(
                "mcp server returned {}",
                resp.status()
            )));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| McpCallError::Failed(format!("bad mcp response: {e}")))?;
        if let Some(error) = value.get("error") {
            let message = error["message"].as_str().unwrap_or_default();
            // -32601/-32602 and "not found"/"unknown tool" wordings all mean
            // the same thing for fallback purposes.
            let code = error["code"].as_i64().unwrap_or(0);
            let lowered = message.to_lowercase();
            if code == -32601
                || code == -32602
                || lowered.contains("not found")
                || lowered.contains("unknown tool")
            {
                return Err(McpCallError::ToolNotFound);
            }
            return Err(McpCallError::Failed(format!("mcp error: {message}")));
        }
        Ok(value["result"].clone())
    }
}

#[async_trait]
impl McpServer for HttpMcpServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health(&self) -> bool {
        self.rpc("ping", json!({})).await.is_ok()
    }

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpCallError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| {
                        Some(McpToolInfo {
                            name: t["name"].as_str()?.to_string(),
                            description: t["description"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, args: &Value) -> Result<(String, bool), McpCallError> {
        let result = self
            .rpc("tools/call", json!({ "name": name, "arguments": args }))
            .await?;
        let is_error = result["isError"].as_bool().unwrap_or(false);
        let content = result["content"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| c["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| result.to_string());
        Ok((content, is_error))
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

struct CachedListing {
    tools: Vec<McpToolInfo>,
    fetched_at: Instant,
}

#[derive(Default)]
pub struct McpRegistry {
    servers: RwLock<Vec<std::sync::Arc<dyn McpServer>>>,
    cache: RwLock<HashMap<String, CachedListing>>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server: std::sync::Arc<dyn McpServer>) {
        self.servers
            .write()
            .expect("mcp lock poisoned")
            .push(server);
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers
            .read()
            .expect("mcp lock poisoned")
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn servers(&self) -> Vec<std::sync::Arc<dyn McpServer>> {
        self.servers.read().expect("mcp lock poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().expect("mcp lock poisoned").is_empty()
    }

    async fn tools_of(
        &self,
        server: &std::sync::Arc<dyn McpServer>,
        ttl: Duration,
    ) -> Option<Vec<McpToolInfo>> {
        {
            let cache = self.cache.read().expect("mcp cache poisoned");
            if let Some(cached) = cache.get(server.name()) {
                if cached.fetched_at.elapsed() < ttl {
                    return Some(cached.tools.clone());
                }
            }
        }
        match server.list_tools().await {
            Ok(tools) => {
                self.cache.write().expect("mcp cache poisoned").insert(
                    server.name().to_string(),
                    CachedListing {
                        tools: tools.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Some(tools)
            }
            Err(e) => {
                warn!(server = %server.name(), error = ?e, "mcp tools/list failed");
                None
            }
        }
    }

    /// Try each registered server in order. Returns `None` when no server
    /// advertises the tool (the caller decides whether that is a gap).
    pub async fn call_fallback(
        &self,
        name: &str,
        args: &Value,
        ttl: Duration,
    ) -> Option<(String, bool)> {
        let servers = self.servers();
        let mut last_error_result: Option<(String, bool)> = None;
        for server in &servers {
            let Some(tools) = self.tools_of(server, ttl).await else {
                continue;
            };
            if !tools.iter().any(|t| t.name == name) {
                continue;
            }
            debug!(server = %server.name(), tool = %name, "dispatching mcp tool call");
            match server.call_tool(name, args).await {
                Ok((content, false)) => return Some((content, false)),
                Ok((content, true)) => {
                    // Remember the error result but keep looking for a
                    // server that succeeds.
                    last_error_result = Some((content, true));
                }
                Err(McpCallError::ToolNotFound) => continue,
                Err(McpCallError::Failed(msg)) => {
                    warn!(server = %server.name(), tool = %name, error = %msg, "mcp call failed");
                    last_error_result.get_or_insert((msg, true));
                }
            }
        }
        last_error_result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct FakeServer {
        name: String,
        tools: Vec<McpToolInfo>,
        response: Result<(String, bool), McpCallError>,
        list_calls: std::sync::atomic::AtomicU32,
    }

    impl FakeServer {
        fn new(
            name: &str,
            tools: &[&str],
            response: Result<(String, bool), McpCallError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                tools: tools
                    .iter()
                    .map(|t| McpToolInfo {
                        name: t.to_string(),
                        description: String::new(),
                    })
                    .collect(),
                response,
                list_calls: Default::default(),
            })
        }
    }

    #[async_trait]
    impl McpServer for FakeServer {
        fn name(&self) -> &str {
            &self.name
        }
        async fn health(&self) -> bool {
            true
        }
        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpCallError> {
            self.list_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.tools.clone())
        }
        async fn call_tool(
            &self,
            _name: &str,
            _args: &Value,
        ) -> Result<(String, bool), McpCallError> {
            self.response.clone()
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn first_server_with_tool_wins() {
        let reg = McpRegistry::new();
        reg.register(FakeServer::new("a", &["other"], Ok(("a-out".into(), false))));
        reg.register(FakeServer::new("b", &["wanted"], Ok(("b-out".into(), false))));
        let got = reg.call_fallback("wanted", &json!({}), TTL).await.unwrap();
        assert_eq!(got, ("b-out".into(), false));
    }

    #[tokio::test]
    async fn tool_not_found_tries_next_server() {
        let reg = McpRegistry::new();
        reg.register(FakeServer::new(
            "stale",
            &["wanted"],
            Err(McpCallError::ToolNotFound),
        ));
        reg.register(FakeServer::new("fresh", &["wanted"], Ok(("ok".into(), false))));
        let got = reg.call_fallback("wanted", &json!({}), TTL).await.unwrap();
        assert_eq!(got, ("ok".into(), false));
    }

    #[tokio::test]
    async fn no_server_advertising_tool_returns_none() {
        let reg = McpRegistry::new();
        reg.register(FakeServer::new("a", &["x"], Ok(("unused".into(), false))));
        assert!(reg.call_fallback("missing", &json!({}), TTL).await.is_none());
    }

    #[tokio::test]
    async fn error_result_is_kept_when_nothing_succeeds() {
        let reg = McpRegistry::new();
        reg.register(FakeServer::new(
            "a",
            &["wanted"],
            Ok(("tool blew up".into(), true)),
        ));
        let got = reg.call_fallback("wanted", &json!({}), TTL).await.unwrap();
        assert_eq!(got.1, true);
        assert!(got.0.contains("blew up"));
    }

    #[tokio::test]
    async fn success_preferred_over_earlier_error_result() {
        let reg = McpRegistry::new();
        reg.register(FakeServer::new("a", &["wanted"], Ok(("bad".into(), true))));
        reg.register(FakeServer::new("b", &["wanted"], Ok(("good".into(), false))));
        let got = reg.call_fallback("wanted", &json!({}), TTL).await.unwrap();
        assert_eq!(got, ("good".into(), false));
    }

    #[tokio::test]
    async fn listing_is_cached_within_ttl() {
        let reg = McpRegistry::new();
        let server = FakeServer::new("a", &["t"], Ok(("ok".into(), false)));
        reg.register(server.clone());
        reg.call_fallback("t", &json!({}), TTL).await;
        reg.call_fallback("t", &json!({}), TTL).await;
        assert_eq!(
            server.list_calls.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "second call must hit the cache"
        );
    }

    #[tokio::test]
    async fn expired_ttl_refetches_listing() {
        let reg = McpRegistry::new();
        let server = FakeServer::new("a", &["t"], Ok(("ok".into(), false)));
        reg.register(server.clone());
        reg.call_fallback("t", &json!({}), Duration::ZERO).await;
        reg.call_fallback("t", &json!({}), Duration::ZERO).await;
        assert_eq!(
            server.list_calls.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }
}
