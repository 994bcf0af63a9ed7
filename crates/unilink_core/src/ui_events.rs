/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;

pub const KIND_MUTATION_FAILED: &str = "mutation_failed";
pub const KIND_STORY_FEED_UPDATED: &str = "story_feed_updated";
pub const KIND_STORY_ADVANCED: &str = "story_advanced";
pub const KIND_STORY_CLOSED: &str = "story_closed";
pub const KIND_CONVERSATIONS_UPDATED: &str = "conversations_updated";
pub const KIND_MESSAGES_UPDATED: &str = "messages_updated";
pub const KIND_ORDERS_INVALIDATED: &str = "orders_invalidated";

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Notification to the embedding UI shell. Carries no state: the shell
/// reads the owning component's observable state after receiving one.
#[derive(Clone, Debug, Serialize)]
pub struct UiEvent {
    pub kind: String,
    pub ts_ms: u64,
    pub topic: Option<String>,
    pub target_id: Option<String>,
}

impl UiEvent {
    pub fn new(kind: &str, topic: Option<String>, target_id: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            ts_ms: now_ms_u64(),
            topic,
            target_id,
        }
    }
}
