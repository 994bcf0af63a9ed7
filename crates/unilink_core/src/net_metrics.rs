/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct NetMetrics {
    pub channel_connected: AtomicBool,
    pub channel_rx_bytes: AtomicU64,
    pub channel_tx_bytes: AtomicU64,
    pub channel_last_change_ms: AtomicU64,
    pub channel_rtt_ema_ms: AtomicU64,
    channel_last_error: Mutex<Option<String>>,

    pub http_timeouts: AtomicU64,
    pub http_errors: AtomicU64,
}

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channel_connected(&self, v: bool) {
        self.channel_connected.store(v, Ordering::Relaxed);
        self.channel_last_change_ms
            .store(now_ms(), Ordering::Relaxed);
        if v {
            let mut g = self.channel_last_error.lock().unwrap();
            *g = None;
        }
    }

    pub fn set_channel_error(&self, err: String) {
        self.set_channel_connected(false);
        let mut g = self.channel_last_error.lock().unwrap();
        *g = Some(err);
    }

    pub fn channel_rx_add(&self, n: u64) {
        self.channel_rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn channel_tx_add(&self, n: u64) {
        self.channel_tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn channel_rtt_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.channel_rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.channel_rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn http_timeout(&self) {
        self.http_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_error(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self.channel_last_error.lock().unwrap().clone();
        serde_json::json!({
            "ts_ms": now_ms(),
            "channel": {
                "connected": self.channel_connected.load(Ordering::Relaxed),
                "rx_bytes": self.channel_rx_bytes.load(Ordering::Relaxed),
                "tx_bytes": self.channel_tx_bytes.load(Ordering::Relaxed),
                "last_change_ms": self.channel_last_change_ms.load(Ordering::Relaxed),
                "rtt_ms": self.channel_rtt_ema_ms.load(Ordering::Relaxed),
                "last_error": last_error,
            },
            "errors": {
                "http_timeouts": self.http_timeouts.load(Ordering::Relaxed),
                "http_errors": self.http_errors.load(Ordering::Relaxed),
            },
        })
    }
}
