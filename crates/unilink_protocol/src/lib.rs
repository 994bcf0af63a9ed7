/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Topics the portal backend publishes on the push channel.
pub const TOPIC_STORY_NEW: &str = "story.new";
pub const TOPIC_ORDER_NEW: &str = "order.new";
pub const TOPIC_ORDER_CANCELLED: &str = "order.cancelled";

/// Frame sent by the client over the event channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { topic: String },
    Leave { topic: String },
}

/// Frame pushed by the server. The payload is advisory only: consumers
/// re-fetch authoritative state instead of patching from it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PushFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}
