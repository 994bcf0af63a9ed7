/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::info;
use unilink_protocol::{TOPIC_ORDER_CANCELLED, TOPIC_ORDER_NEW, TOPIC_STORY_NEW};

use crate::api::{HttpPortalApi, PortalApi};
use crate::channel::WsEventChannel;
use crate::conversations::{ConversationSync, DEFAULT_POLL_INTERVAL_SECS};
use crate::fanout::{NotificationFanout, RefreshFn};
use crate::net_metrics::NetMetrics;
use crate::optimistic::{InteractionKind, LikeState, Mutations};
use crate::stories::{CloseCallback, StoryFeed, StoryPlayer, DEFAULT_STORY_DURATION_MS};
use crate::ui_events::{self, UiEvent};

#[derive(Clone, serde::Deserialize)]
pub struct SessionConfig {
    pub api_base: String,
    pub channel_ws: String,
    pub auth_token: String,
    pub user_id: String,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub story_duration_ms: Option<u64>,
    /// HTTP client timeout for outbound requests (seconds).
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8088".to_string(),
            channel_ws: "ws://127.0.0.1:8088".to_string(),
            auth_token: "devtoken".to_string(),
            user_id: "alice".to_string(),
            poll_interval_secs: None,
            story_duration_ms: None,
            http_timeout_secs: None,
        }
    }
}

/// One signed-in client session: owns the HTTP facility, the push
/// channel, the real-time components and the shutdown switch that tears
/// every worker and timer down together.
pub struct Session {
    api: Arc<dyn PortalApi>,
    feed: StoryFeed,
    conversations: ConversationSync,
    mutations: Arc<Mutations>,
    net: Arc<NetMetrics>,
    ui_events: broadcast::Sender<UiEvent>,
    shutdown_tx: watch::Sender<bool>,
    story_duration_ms: u64,
}

impl Session {
    /// Must run inside a tokio runtime: workers are spawned here.
    pub fn start(cfg: SessionConfig) -> Result<Session> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("info".parse().unwrap()),
            )
            .try_init()
            .ok();

        anyhow::ensure!(
            !cfg.auth_token.trim().is_empty(),
            "auth_token missing; set it in the app settings"
        );
        anyhow::ensure!(!cfg.api_base.trim().is_empty(), "api_base missing");

        let http_timeout_secs = cfg.http_timeout_secs.unwrap_or(30).clamp(5, 120);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(http_timeout_secs))
            .build()
            .context("build http client")?;

        let net = Arc::new(NetMetrics::new());
        let api: Arc<dyn PortalApi> = Arc::new(HttpPortalApi::new(
            &cfg.api_base,
            &cfg.auth_token,
            http,
            net.clone(),
        ));
        let (ui_events, _) = broadcast::channel::<UiEvent>(512);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channel = WsEventChannel::start(
            &cfg.channel_ws,
            &cfg.auth_token,
            net.clone(),
            shutdown_rx.clone(),
        );

        let poll_interval = Duration::from_secs(
            cfg.poll_interval_secs
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
                .clamp(1, 60),
        );
        let story_duration_ms = cfg
            .story_duration_ms
            .unwrap_or(DEFAULT_STORY_DURATION_MS)
            .clamp(1_000, 30_000);

        let feed = StoryFeed::new(api.clone(), ui_events.clone());
        let conversations = ConversationSync::new(api.clone(), ui_events.clone(), poll_interval);
        let mutations = Arc::new(Mutations::new(ui_events.clone()));

        let feed_for_fanout = feed.clone();
        NotificationFanout::new(channel)
            .on_topic(
                TOPIC_STORY_NEW,
                Box::new(move || {
                    let feed = feed_for_fanout.clone();
                    Box::pin(async move { feed.refresh().await })
                }),
            )
            .on_topic(TOPIC_ORDER_NEW, invalidate_orders(ui_events.clone(), TOPIC_ORDER_NEW))
            .on_topic(
                TOPIC_ORDER_CANCELLED,
                invalidate_orders(ui_events.clone(), TOPIC_ORDER_CANCELLED),
            )
            .start(shutdown_rx);

        // Mount-time refresh so the first render has data to show.
        {
            let feed = feed.clone();
            let conversations = conversations.clone();
            tokio::spawn(async move {
                feed.refresh().await;
                conversations.refresh_list().await;
            });
        }

        info!("session started for {}", cfg.user_id);
        Ok(Session {
            api,
            feed,
            conversations,
            mutations,
            net,
            ui_events,
            shutdown_tx,
            story_duration_ms,
        })
    }

    pub fn stories(&self) -> &StoryFeed {
        &self.feed
    }

    pub fn conversations(&self) -> &ConversationSync {
        &self.conversations
    }

    pub fn mutations(&self) -> &Mutations {
        &self.mutations
    }

    pub fn ui_events(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_events.subscribe()
    }

    pub fn metrics_snapshot(&self) -> serde_json::Value {
        self.net.snapshot_json()
    }

    /// Open a viewer on one feed entry.
    pub fn open_story(
        &self,
        entry_index: usize,
        on_close: Option<CloseCallback>,
    ) -> Result<StoryPlayer> {
        let entry = self
            .feed
            .entry(entry_index)
            .with_context(|| format!("story entry {entry_index} out of range"))?;
        StoryPlayer::open(
            self.api.clone(),
            self.ui_events.clone(),
            self.story_duration_ms,
            entry_index,
            entry,
            on_close,
        )
    }

    /// Optimistic like/unlike for a post: flips the flag and moves the
    /// counter immediately, rolls both back if the server rejects it.
    pub fn like(
        &self,
        post_id: &str,
        prior: LikeState,
        install: impl Fn(LikeState) + Send + 'static,
    ) -> Result<()> {
        let next = prior.toggled();
        let api = self.api.clone();
        let id = post_id.to_string();
        let liked = next.liked;
        self.mutations.apply(
            InteractionKind::Like,
            post_id,
            prior,
            next,
            install,
            move || async move { api.toggle_like(&id, liked).await },
        )
    }

    /// Optimistic follow/unfollow for a user.
    pub fn follow(
        &self,
        user_id: &str,
        prior: bool,
        install: impl Fn(bool) + Send + 'static,
    ) -> Result<()> {
        let api = self.api.clone();
        let id = user_id.to_string();
        let following = !prior;
        self.mutations.apply(
            InteractionKind::Follow,
            user_id,
            prior,
            following,
            install,
            move || async move { api.toggle_follow(&id, following).await },
        )
    }

    /// Optimistic delete of a post out of a visible list. `prior` and
    /// `speculative` come from `optimistic::remove_at`, so a rollback
    /// restores the item at its original index.
    pub fn delete_post<T>(
        &self,
        post_id: &str,
        prior: Vec<T>,
        speculative: Vec<T>,
        install: impl Fn(Vec<T>) + Send + 'static,
    ) -> Result<()>
    where
        T: Clone + Send + 'static,
    {
        let api = self.api.clone();
        let id = post_id.to_string();
        self.mutations.apply(
            InteractionKind::Delete,
            post_id,
            prior,
            speculative,
            install,
            move || async move { api.delete_post(&id).await },
        )
    }

    /// Tear down every worker, timer and subscription owned by the
    /// session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.conversations.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn invalidate_orders(ui: broadcast::Sender<UiEvent>, topic: &'static str) -> RefreshFn {
    // Order screens live outside this crate; their refresh entry point
    // is the UI shell's, reached through the event bus.
    Box::new(move || {
        let ui = ui.clone();
        Box::pin(async move {
            let _ = ui.send(UiEvent::new(
                ui_events::KIND_ORDERS_INVALIDATED,
                Some(topic.to_string()),
                None,
            ));
        })
    })
}
