// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! SSE line reassembly for upstream byte streams.
//!
//! SSE lines can be split across TCP chunks, so a remainder buffer carries
//! the incomplete tail forward; only lines terminated by `\n` are parsed.

/// One parsed SSE payload: optional event name plus the raw data bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SsePayload {
    pub event: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct SseBuffer {
    buf: String,
    pending_event: Option<String>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every payload completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SsePayload> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line = self.buf[..pos].trim_end_matches('\r').to_string();
            self.buf.drain(..=pos);
            if let Some(name) = line.strip_prefix("event: ") {
                self.pending_event = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data: ") {
                out.push(SsePayload {
                    event: self.pending_event.take(),
                    data: data.trim().as_bytes().to_vec(),
                });
            } else if line.is_empty() {
                self.pending_event = None;
            }
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
