/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::PortalApi;
use crate::scheduler::TimerSlot;
use crate::ui_events::{self, UiEvent};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Sidebar row: one entry per distinct peer, keyed by `partner.id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub partner: UserRef,
    pub last_message: String,
    pub last_message_at_ms: i64,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at_ms: i64,
}

struct ConvInner {
    conversations: Vec<Conversation>,
    active_peer: Option<UserRef>,
    history: Vec<Message>,
}

struct ConvShared {
    api: Arc<dyn PortalApi>,
    ui: broadcast::Sender<UiEvent>,
    poll_interval: Duration,
    inner: Mutex<ConvInner>,
    poll: Mutex<TimerSlot>,
}

/// Local mirror of the conversation list and the open peer's message
/// history, reconciled against the server by full-snapshot replacement:
/// the list on demand, the history on a recurring silent poll.
#[derive(Clone)]
pub struct ConversationSync {
    shared: Arc<ConvShared>,
}

impl ConversationSync {
    pub fn new(
        api: Arc<dyn PortalApi>,
        ui: broadcast::Sender<UiEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ConvShared {
                api,
                ui,
                poll_interval,
                inner: Mutex::new(ConvInner {
                    conversations: Vec::new(),
                    active_peer: None,
                    history: Vec::new(),
                }),
                poll: Mutex::new(TimerSlot::new()),
            }),
        }
    }

    /// Replace the conversation list with the server's snapshot. On
    /// failure the held snapshot stays; the next trigger heals it.
    pub async fn refresh_list(&self) {
        match self.shared.api.fetch_conversations().await {
            Ok(list) => {
                self.shared.inner.lock().unwrap().conversations = list;
                let _ = self.shared.ui.send(UiEvent::new(
                    ui_events::KIND_CONVERSATIONS_UPDATED,
                    None,
                    None,
                ));
            }
            Err(e) => {
                debug!("conversation list refresh failed: {e:#}");
            }
        }
    }

    /// Open a peer conversation: cancel any previous poll, zero the
    /// unread badge, fetch history once, then poll silently. A peer not
    /// in the list yet (deep link) is resolved via a side lookup and
    /// starts with an empty history.
    pub async fn select_peer(&self, peer_id: &str) -> Result<()> {
        self.shared.poll.lock().unwrap().disarm();

        let known = {
            let inner = self.shared.inner.lock().unwrap();
            inner
                .conversations
                .iter()
                .find(|c| c.partner.id == peer_id)
                .map(|c| c.partner.clone())
        };
        let partner = match known {
            Some(p) => p,
            None => self
                .shared
                .api
                .resolve_user(peer_id)
                .await
                .with_context(|| format!("resolve peer {peer_id}"))?,
        };

        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.active_peer = Some(partner.clone());
            inner.history.clear();
            match inner
                .conversations
                .iter()
                .position(|c| c.partner.id == peer_id)
            {
                Some(i) => inner.conversations[i].unread_count = 0,
                None => inner.conversations.insert(
                    0,
                    Conversation {
                        partner,
                        last_message: String::new(),
                        last_message_at_ms: now_ms(),
                        unread_count: 0,
                    },
                ),
            }
        }
        let _ = self.shared.ui.send(UiEvent::new(
            ui_events::KIND_CONVERSATIONS_UPDATED,
            None,
            None,
        ));

        poll_once(self.shared.clone(), peer_id.to_string()).await;

        let shared = self.shared.clone();
        let peer = peer_id.to_string();
        self.shared
            .poll
            .lock()
            .unwrap()
            .arm_every(self.shared.poll_interval, move || {
                poll_once(shared.clone(), peer.clone())
            });
        Ok(())
    }

    pub fn deselect_peer(&self) {
        self.shared.poll.lock().unwrap().disarm();
        let mut inner = self.shared.inner.lock().unwrap();
        inner.active_peer = None;
        inner.history.clear();
    }

    /// Send is request/response, not optimistic: the message is appended
    /// only once the server returns the canonical record. On failure the
    /// error propagates and nothing is appended, so the caller keeps the
    /// draft for retry.
    pub async fn send(&self, peer_id: &str, content: &str) -> Result<Message> {
        let content = content.trim();
        anyhow::ensure!(!content.is_empty(), "empty message");

        let msg = self
            .shared
            .api
            .send_message(peer_id, content)
            .await
            .with_context(|| format!("send message to {peer_id}"))?;

        {
            let mut inner = self.shared.inner.lock().unwrap();
            let active = inner.active_peer.as_ref().map(|p| p.id.clone());
            if active.as_deref() == Some(peer_id)
                && !inner.history.iter().any(|m| m.id == msg.id)
            {
                inner.history.push(msg.clone());
                inner.history.sort_by_key(|m| m.created_at_ms);
            }
        }
        let _ = self.shared.ui.send(UiEvent::new(
            ui_events::KIND_MESSAGES_UPDATED,
            None,
            Some(peer_id.to_string()),
        ));

        // Sidebar preview must reflect the send immediately.
        self.refresh_list().await;
        Ok(msg)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.shared.inner.lock().unwrap().conversations.clone()
    }

    pub fn history(&self) -> Vec<Message> {
        self.shared.inner.lock().unwrap().history.clone()
    }

    pub fn active_peer(&self) -> Option<UserRef> {
        self.shared.inner.lock().unwrap().active_peer.clone()
    }

    pub fn unread_total(&self) -> u32 {
        self.shared
            .inner
            .lock()
            .unwrap()
            .conversations
            .iter()
            .map(|c| c.unread_count)
            .sum()
    }

    pub fn shutdown(&self) {
        self.shared.poll.lock().unwrap().disarm();
    }
}

/// One silent history poll: replace, never merge. A fetch that lands
/// after the peer changed is discarded.
async fn poll_once(shared: Arc<ConvShared>, peer_id: String) {
    let fetched = match shared.api.fetch_messages(&peer_id).await {
        Ok(v) => v,
        Err(e) => {
            debug!("message poll failed for {peer_id}: {e:#}");
            return;
        }
    };
    {
        let mut inner = shared.inner.lock().unwrap();
        if inner.active_peer.as_ref().map(|p| p.id.as_str()) != Some(peer_id.as_str()) {
            return;
        }
        let mut history = fetched;
        history.sort_by_key(|m| m.created_at_ms);
        inner.history = history;
    }
    let _ = shared.ui.send(UiEvent::new(
        ui_events::KIND_MESSAGES_UPDATED,
        None,
        Some(peer_id),
    ));
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stories::StoryFeedEntry;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeApi {
        conversations: Mutex<Vec<Conversation>>,
        histories: Mutex<HashMap<String, Vec<Message>>>,
        history_calls: Mutex<Vec<String>>,
        list_calls: Mutex<u32>,
        resolve_calls: Mutex<Vec<String>>,
        fail_send: bool,
    }

    impl FakeApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                conversations: Mutex::new(Vec::new()),
                histories: Mutex::new(HashMap::new()),
                history_calls: Mutex::new(Vec::new()),
                list_calls: Mutex::new(0),
                resolve_calls: Mutex::new(Vec::new()),
                fail_send: false,
            })
        }

        fn failing_send() -> Arc<Self> {
            Arc::new(Self {
                conversations: Mutex::new(Vec::new()),
                histories: Mutex::new(HashMap::new()),
                history_calls: Mutex::new(Vec::new()),
                list_calls: Mutex::new(0),
                resolve_calls: Mutex::new(Vec::new()),
                fail_send: true,
            })
        }

        fn set_history(&self, peer: &str, msgs: Vec<Message>) {
            self.histories
                .lock()
                .unwrap()
                .insert(peer.to_string(), msgs);
        }

        fn history_calls(&self) -> Vec<String> {
            self.history_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PortalApi for FakeApi {
        async fn fetch_story_feed(&self) -> Result<Vec<StoryFeedEntry>> {
            Ok(Vec::new())
        }

        async fn mark_story_viewed(&self, _story_id: &str) -> Result<()> {
            Ok(())
        }

        async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self.conversations.lock().unwrap().clone())
        }

        async fn fetch_messages(&self, peer_id: &str) -> Result<Vec<Message>> {
            self.history_calls.lock().unwrap().push(peer_id.to_string());
            Ok(self
                .histories
                .lock()
                .unwrap()
                .get(peer_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn send_message(&self, peer_id: &str, content: &str) -> Result<Message> {
            if self.fail_send {
                anyhow::bail!("502");
            }
            Ok(Message {
                id: format!("srv-{content}"),
                sender_id: "me".to_string(),
                receiver_id: peer_id.to_string(),
                content: content.to_string(),
                created_at_ms: now_ms(),
            })
        }

        async fn toggle_like(&self, _target_id: &str, _liked: bool) -> Result<()> {
            Ok(())
        }

        async fn toggle_follow(&self, _target_id: &str, _following: bool) -> Result<()> {
            Ok(())
        }

        async fn delete_post(&self, _post_id: &str) -> Result<()> {
            Ok(())
        }

        async fn resolve_user(&self, user_id: &str) -> Result<UserRef> {
            self.resolve_calls.lock().unwrap().push(user_id.to_string());
            Ok(user(user_id))
        }
    }

    fn user(id: &str) -> UserRef {
        UserRef {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            avatar_url: None,
        }
    }

    fn conv(peer: &str, unread: u32) -> Conversation {
        Conversation {
            partner: user(peer),
            last_message: "hi".to_string(),
            last_message_at_ms: 1,
            unread_count: unread,
        }
    }

    fn msg(id: &str, at: i64) -> Message {
        Message {
            id: id.to_string(),
            sender_id: "peer".to_string(),
            receiver_id: "me".to_string(),
            content: id.to_string(),
            created_at_ms: at,
        }
    }

    fn ui() -> broadcast::Sender<UiEvent> {
        broadcast::channel(64).0
    }

    fn sync_with(api: Arc<FakeApi>) -> ConversationSync {
        ConversationSync::new(api, ui(), Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS))
    }

    #[tokio::test(start_paused = true)]
    async fn list_refresh_replaces_the_snapshot() {
        let api = FakeApi::new();
        *api.conversations.lock().unwrap() = vec![conv("ana", 2), conv("bo", 0)];
        let sync = sync_with(api.clone());

        sync.refresh_list().await;
        assert_eq!(sync.conversations().len(), 2);
        assert_eq!(sync.unread_total(), 2);

        *api.conversations.lock().unwrap() = vec![conv("bo", 1)];
        sync.refresh_list().await;
        let list = sync.conversations();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].partner.id, "bo");
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_a_peer_zeroes_unread_and_starts_polling() {
        let api = FakeApi::new();
        *api.conversations.lock().unwrap() = vec![conv("ana", 3)];
        api.set_history("ana", vec![msg("m1", 10)]);
        let sync = sync_with(api.clone());
        sync.refresh_list().await;

        sync.select_peer("ana").await.unwrap();
        assert_eq!(sync.conversations()[0].unread_count, 0);
        assert_eq!(sync.history().len(), 1);
        assert_eq!(api.history_calls(), vec!["ana"]);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(api.history_calls(), vec!["ana", "ana", "ana"]);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_peers_leaves_one_polling_timer() {
        let api = FakeApi::new();
        *api.conversations.lock().unwrap() = vec![conv("ana", 0), conv("bo", 0)];
        let sync = sync_with(api.clone());
        sync.refresh_list().await;

        sync.select_peer("ana").await.unwrap();
        sync.select_peer("bo").await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let calls = api.history_calls();
        // One immediate fetch each, then ticks for bo only.
        assert_eq!(calls[..2], ["ana".to_string(), "bo".to_string()]);
        assert!(calls[2..].iter().all(|p| p == "bo"));
        assert_eq!(calls.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_replaces_instead_of_merging() {
        let api = FakeApi::new();
        *api.conversations.lock().unwrap() = vec![conv("ana", 0)];
        api.set_history("ana", vec![msg("m1", 10), msg("m2", 20)]);
        let sync = sync_with(api.clone());
        sync.refresh_list().await;
        sync.select_peer("ana").await.unwrap();

        let ids: Vec<String> = sync.history().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);

        // m2 disappears server-side; the next tick drops it locally too.
        api.set_history("ana", vec![msg("m1", 10), msg("m3", 30)]);
        tokio::time::sleep(Duration::from_secs(6)).await;
        let ids: Vec<String> = sync.history().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn deselecting_stops_the_poll() {
        let api = FakeApi::new();
        *api.conversations.lock().unwrap() = vec![conv("ana", 0)];
        let sync = sync_with(api.clone());
        sync.refresh_list().await;
        sync.select_peer("ana").await.unwrap();
        sync.deselect_peer();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.history_calls(), vec!["ana"]);
        assert!(sync.active_peer().is_none());
        assert!(sync.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deep_link_resolves_the_peer_with_empty_history() {
        let api = FakeApi::new();
        let sync = sync_with(api.clone());

        sync.select_peer("zoe").await.unwrap();
        assert_eq!(api.resolve_calls.lock().unwrap().clone(), vec!["zoe"]);
        assert_eq!(sync.active_peer().unwrap().id, "zoe");
        assert!(sync.history().is_empty());
        assert_eq!(sync.conversations()[0].partner.id, "zoe");
    }

    #[tokio::test(start_paused = true)]
    async fn send_appends_canonical_message_and_refreshes_list() {
        let api = FakeApi::new();
        *api.conversations.lock().unwrap() = vec![conv("ana", 0)];
        let sync = sync_with(api.clone());
        sync.refresh_list().await;
        sync.select_peer("ana").await.unwrap();

        let before = *api.list_calls.lock().unwrap();
        let sent = sync.send("ana", "  hello ").await.unwrap();
        assert_eq!(sent.content, "hello");
        assert_eq!(sync.history().last().unwrap().id, sent.id);
        assert_eq!(*api.list_calls.lock().unwrap(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_leaves_history_untouched() {
        let api = FakeApi::failing_send();
        *api.conversations.lock().unwrap() = vec![conv("ana", 0)];
        api.set_history("ana", vec![msg("m1", 10)]);
        let sync = sync_with(api.clone());
        sync.refresh_list().await;
        sync.select_peer("ana").await.unwrap();

        assert!(sync.send("ana", "hello").await.is_err());
        let ids: Vec<String> = sync.history().iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec!["m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_send_is_rejected_locally() {
        let api = FakeApi::new();
        let sync = sync_with(api);
        assert!(sync.send("ana", "   ").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_poll_result_is_discarded() {
        let api = FakeApi::new();
        *api.conversations.lock().unwrap() = vec![conv("ana", 0)];
        api.set_history("ana", vec![msg("m1", 10)]);
        let sync = sync_with(api.clone());
        sync.refresh_list().await;
        sync.select_peer("ana").await.unwrap();
        assert_eq!(sync.history().len(), 1);

        // A poll for a peer that is no longer active must not clobber
        // the current history.
        poll_once(sync.shared.clone(), "bo".to_string()).await;
        assert_eq!(sync.history().len(), 1);
    }
}
