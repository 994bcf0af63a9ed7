/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::PortalApi;
use crate::scheduler::TimerSlot;
use crate::ui_events::{self, UiEvent};

pub const DEFAULT_STORY_DURATION_MS: u64 = 5_000;
pub const STORY_TICK_MS: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryAuthor {
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryItem {
    pub id: String,
    pub author_id: String,
    pub media_url: String,
    pub created_at_ms: i64,
    /// Server sets this to created_at_ms + 24h; anything past it is
    /// stale and must not be rendered.
    pub expires_at_ms: i64,
}

/// One author's stories, oldest first. Feed order is the server's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryFeedEntry {
    pub author: StoryAuthor,
    pub stories: Vec<StoryItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Closed,
}

/// Session-local playback position. One per open viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackCursor {
    pub entry_index: usize,
    pub item_index: usize,
    pub elapsed_ms: u64,
}

pub type CloseCallback = Box<dyn Fn(usize) + Send + Sync>;

struct PlayerInner {
    entry: StoryFeedEntry,
    cursor: PlaybackCursor,
    state: PlaybackState,
}

struct PlayerShared {
    api: Arc<dyn PortalApi>,
    ui: broadcast::Sender<UiEvent>,
    duration_ms: u64,
    on_close: Option<CloseCallback>,
    inner: Mutex<PlayerInner>,
    timer: Mutex<TimerSlot>,
}

enum Transition {
    Noop,
    Advanced { story_id: String },
    Exhausted { entry_index: usize },
}

/// Timed playback over one feed entry: a 50 ms progress tick advances
/// through the items and closes the viewer after the last one. User
/// navigation cancels and re-arms the tick so a pending tick can never
/// advance twice.
pub struct StoryPlayer {
    shared: Arc<PlayerShared>,
}

impl StoryPlayer {
    pub fn open(
        api: Arc<dyn PortalApi>,
        ui: broadcast::Sender<UiEvent>,
        duration_ms: u64,
        entry_index: usize,
        mut entry: StoryFeedEntry,
        on_close: Option<CloseCallback>,
    ) -> Result<Self> {
        let now = now_ms();
        entry.stories.retain(|s| s.expires_at_ms > now);
        anyhow::ensure!(
            !entry.stories.is_empty(),
            "no playable stories for author {}",
            entry.author.id
        );

        let first_id = entry.stories[0].id.clone();
        let shared = Arc::new(PlayerShared {
            api,
            ui,
            duration_ms: duration_ms.clamp(1_000, 30_000),
            on_close,
            inner: Mutex::new(PlayerInner {
                entry,
                cursor: PlaybackCursor {
                    entry_index,
                    item_index: 0,
                    elapsed_ms: 0,
                },
                state: PlaybackState::Playing,
            }),
            timer: Mutex::new(TimerSlot::new()),
        });

        fire_view_ping(&shared, first_id);
        arm(&shared);
        Ok(Self { shared })
    }

    /// Step back one item. No-op on the first item or after close.
    pub fn back(&self) -> bool {
        let story_id = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == PlaybackState::Closed || inner.cursor.item_index == 0 {
                return false;
            }
            inner.cursor.item_index -= 1;
            inner.cursor.elapsed_ms = 0;
            inner.entry.stories[inner.cursor.item_index].id.clone()
        };
        fire_view_ping(&self.shared, story_id.clone());
        let _ = self.shared.ui.send(UiEvent::new(
            ui_events::KIND_STORY_ADVANCED,
            None,
            Some(story_id),
        ));
        arm(&self.shared);
        true
    }

    /// Skip ahead: same transition as timer expiry.
    pub fn forward(&self) -> bool {
        match advance(&self.shared) {
            Transition::Noop => false,
            Transition::Advanced { .. } => {
                arm(&self.shared);
                true
            }
            Transition::Exhausted { .. } => true,
        }
    }

    /// Close the viewer early; cancels the tick and discards the cursor.
    pub fn close(&self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == PlaybackState::Closed {
                return;
            }
            inner.state = PlaybackState::Closed;
        }
        self.shared.timer.lock().unwrap().disarm();
        let _ = self
            .shared
            .ui
            .send(UiEvent::new(ui_events::KIND_STORY_CLOSED, None, None));
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.shared.inner.lock().unwrap().cursor
    }

    pub fn item_count(&self) -> usize {
        self.shared.inner.lock().unwrap().entry.stories.len()
    }

    /// Progress of the current item, 0.0..=1.0.
    pub fn progress(&self) -> f32 {
        let inner = self.shared.inner.lock().unwrap();
        progress_fraction(&inner, self.shared.duration_ms, inner.cursor.item_index)
    }

    /// Progress bar fraction for any item: full below the cursor, the
    /// running fraction at it, empty above it.
    pub fn progress_for(&self, item_index: usize) -> f32 {
        let inner = self.shared.inner.lock().unwrap();
        progress_fraction(&inner, self.shared.duration_ms, item_index)
    }
}

impl Drop for StoryPlayer {
    fn drop(&mut self) {
        // Breaks the timer-task -> shared cycle; no orphaned tick may
        // outlive the viewer.
        self.shared.inner.lock().unwrap().state = PlaybackState::Closed;
        self.shared.timer.lock().unwrap().disarm();
    }
}

fn progress_fraction(inner: &PlayerInner, duration_ms: u64, item_index: usize) -> f32 {
    if inner.state == PlaybackState::Closed {
        return if item_index < inner.entry.stories.len() {
            1.0
        } else {
            0.0
        };
    }
    if item_index < inner.cursor.item_index {
        1.0
    } else if item_index > inner.cursor.item_index {
        0.0
    } else {
        (inner.cursor.elapsed_ms as f32 / duration_ms as f32).min(1.0)
    }
}

fn arm(shared: &Arc<PlayerShared>) {
    let s = shared.clone();
    shared.timer.lock().unwrap().arm_every(
        Duration::from_millis(STORY_TICK_MS),
        move || {
            let s = s.clone();
            async move {
                step(&s);
            }
        },
    );
}

fn step(shared: &Arc<PlayerShared>) {
    {
        let mut inner = shared.inner.lock().unwrap();
        if inner.state == PlaybackState::Closed {
            return;
        }
        inner.cursor.elapsed_ms += STORY_TICK_MS;
        if inner.cursor.elapsed_ms < shared.duration_ms {
            return;
        }
    }
    advance(shared);
}

/// Advance-or-close, shared by the tick and the forward action. Media
/// readiness is never consulted; the timer alone drives playback.
fn advance(shared: &Arc<PlayerShared>) -> Transition {
    let transition = {
        let mut inner = shared.inner.lock().unwrap();
        if inner.state == PlaybackState::Closed {
            Transition::Noop
        } else if inner.cursor.item_index + 1 < inner.entry.stories.len() {
            inner.cursor.item_index += 1;
            inner.cursor.elapsed_ms = 0;
            Transition::Advanced {
                story_id: inner.entry.stories[inner.cursor.item_index].id.clone(),
            }
        } else {
            inner.state = PlaybackState::Closed;
            Transition::Exhausted {
                entry_index: inner.cursor.entry_index,
            }
        }
    };
    match &transition {
        Transition::Noop => {}
        Transition::Advanced { story_id } => {
            fire_view_ping(shared, story_id.clone());
            let _ = shared.ui.send(UiEvent::new(
                ui_events::KIND_STORY_ADVANCED,
                None,
                Some(story_id.clone()),
            ));
        }
        Transition::Exhausted { entry_index } => {
            shared.timer.lock().unwrap().disarm();
            let _ = shared
                .ui
                .send(UiEvent::new(ui_events::KIND_STORY_CLOSED, None, None));
            if let Some(cb) = shared.on_close.as_ref() {
                cb(*entry_index);
            }
        }
    }
    transition
}

fn fire_view_ping(shared: &Arc<PlayerShared>, story_id: String) {
    let api = shared.api.clone();
    tokio::spawn(async move {
        // Telemetry only; a failed ping never affects playback.
        if let Err(e) = api.mark_story_viewed(&story_id).await {
            debug!("story view ping failed ({story_id}): {e:#}");
        }
    });
}

/// Latest story feed snapshot, replaced wholesale on every refresh.
#[derive(Clone)]
pub struct StoryFeed {
    shared: Arc<FeedShared>,
}

struct FeedShared {
    api: Arc<dyn PortalApi>,
    ui: broadcast::Sender<UiEvent>,
    entries: Mutex<Vec<StoryFeedEntry>>,
}

impl StoryFeed {
    pub fn new(api: Arc<dyn PortalApi>, ui: broadcast::Sender<UiEvent>) -> Self {
        Self {
            shared: Arc::new(FeedShared {
                api,
                ui,
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Full authoritative re-fetch. On failure the previous snapshot is
    /// kept; the next refresh trigger heals it.
    pub async fn refresh(&self) {
        match self.shared.api.fetch_story_feed().await {
            Ok(mut entries) => {
                let now = now_ms();
                for entry in &mut entries {
                    entry.stories.retain(|s| s.expires_at_ms > now);
                }
                entries.retain(|e| !e.stories.is_empty());
                *self.shared.entries.lock().unwrap() = entries;
                let _ = self.shared.ui.send(UiEvent::new(
                    ui_events::KIND_STORY_FEED_UPDATED,
                    None,
                    None,
                ));
            }
            Err(e) => {
                debug!("story feed refresh failed: {e:#}");
            }
        }
    }

    pub fn entries(&self) -> Vec<StoryFeedEntry> {
        self.shared.entries.lock().unwrap().clone()
    }

    pub fn entry(&self, index: usize) -> Option<StoryFeedEntry> {
        self.shared.entries.lock().unwrap().get(index).cloned()
    }
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
    use crate::conversations::{Conversation, Message, UserRef};
    use anyhow::Result;
    use async_trait::async_trait;

    struct FakeApi {
        viewed: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                viewed: Mutex::new(Vec::new()),
            })
        }

        fn viewed(&self) -> Vec<String> {
            self.viewed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PortalApi for FakeApi {
        async fn fetch_story_feed(&self) -> Result<Vec<StoryFeedEntry>> {
            Ok(Vec::new())
        }

        async fn mark_story_viewed(&self, story_id: &str) -> Result<()> {
            self.viewed.lock().unwrap().push(story_id.to_string());
            Ok(())
        }

        async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
            Ok(Vec::new())
        }

        async fn fetch_messages(&self, _peer_id: &str) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn send_message(&self, _peer_id: &str, _content: &str) -> Result<Message> {
            anyhow::bail!("not used")
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

        async fn resolve_user(&self, _user_id: &str) -> Result<UserRef> {
            anyhow::bail!("not used")
        }
    }

    fn entry_with(n: usize) -> StoryFeedEntry {
        let now = now_ms();
        StoryFeedEntry {
            author: StoryAuthor {
                id: "auth-1".to_string(),
                display_name: "Casey".to_string(),
                avatar_url: None,
            },
            stories: (0..n)
                .map(|i| StoryItem {
                    id: format!("s{}", i + 1),
                    author_id: "auth-1".to_string(),
                    media_url: format!("https://cdn.example/s{}.jpg", i + 1),
                    created_at_ms: now - 1_000 * (n - i) as i64,
                    expires_at_ms: now + 3_600_000,
                })
                .collect(),
        }
    }

    fn ui() -> broadcast::Sender<UiEvent> {
        broadcast::channel(64).0
    }

    async fn settle() {
        // Let spawned ping tasks run.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plays_items_in_order_then_closes() {
        let api = FakeApi::new();
        let player = StoryPlayer::open(
            api.clone(),
            ui(),
            DEFAULT_STORY_DURATION_MS,
            0,
            entry_with(3),
            None,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;

        assert_eq!(player.state(), PlaybackState::Closed);
        assert_eq!(api.viewed(), vec!["s1", "s2", "s3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_invokes_close_callback() {
        let api = FakeApi::new();
        let closed = Arc::new(Mutex::new(Vec::new()));
        let c = closed.clone();
        let _player = StoryPlayer::open(
            api,
            ui(),
            DEFAULT_STORY_DURATION_MS,
            7,
            entry_with(1),
            Some(Box::new(move |entry_index| {
                c.lock().unwrap().push(entry_index);
            })),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(closed.lock().unwrap().clone(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_tracks_elapsed_time() {
        let api = FakeApi::new();
        let player = StoryPlayer::open(
            api,
            ui(),
            DEFAULT_STORY_DURATION_MS,
            0,
            entry_with(2),
            None,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!((player.progress() - 0.5).abs() < 0.02);
        assert_eq!(player.progress_for(1), 0.0);

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        assert_eq!(player.progress_for(0), 1.0);
        assert!(player.progress() < 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_cancels_the_pending_tick() {
        let api = FakeApi::new();
        let player = StoryPlayer::open(
            api.clone(),
            ui(),
            DEFAULT_STORY_DURATION_MS,
            0,
            entry_with(3),
            None,
        )
        .unwrap();

        // Almost at expiry, then skip ahead by hand: the old tick must
        // not fire a second advance on top of it.
        tokio::time::sleep(Duration::from_millis(4_950)).await;
        assert!(player.forward());
        settle().await;
        assert_eq!(player.cursor().item_index, 1);
        assert_eq!(player.cursor().elapsed_ms, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(player.cursor().item_index, 1);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(player.cursor().item_index, 2);
        assert_eq!(player.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn back_replays_the_previous_item() {
        let api = FakeApi::new();
        let player = StoryPlayer::open(
            api.clone(),
            ui(),
            DEFAULT_STORY_DURATION_MS,
            0,
            entry_with(2),
            None,
        )
        .unwrap();
        settle().await;

        assert!(!player.back());

        assert!(player.forward());
        settle().await;
        assert!(player.back());
        settle().await;

        assert_eq!(player.cursor().item_index, 0);
        assert_eq!(player.cursor().elapsed_ms, 0);
        assert_eq!(api.viewed(), vec!["s1", "s2", "s1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_items_are_dropped_at_open() {
        let api = FakeApi::new();
        let mut entry = entry_with(3);
        entry.stories[0].expires_at_ms = now_ms() - 1;
        let player = StoryPlayer::open(
            api.clone(),
            ui(),
            DEFAULT_STORY_DURATION_MS,
            0,
            entry,
            None,
        )
        .unwrap();
        settle().await;

        assert_eq!(player.item_count(), 2);
        assert_eq!(api.viewed(), vec!["s2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_fails_when_everything_expired() {
        let api = FakeApi::new();
        let mut entry = entry_with(1);
        entry.stories[0].expires_at_ms = now_ms() - 1;
        assert!(StoryPlayer::open(api, ui(), DEFAULT_STORY_DURATION_MS, 0, entry, None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_timer() {
        let api = FakeApi::new();
        let player = StoryPlayer::open(
            api.clone(),
            ui(),
            DEFAULT_STORY_DURATION_MS,
            0,
            entry_with(3),
            None,
        )
        .unwrap();
        player.close();

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(player.state(), PlaybackState::Closed);
        assert_eq!(api.viewed(), vec!["s1"]);
    }
}
