/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use urlencoding::encode;

use crate::conversations::{Conversation, Message, UserRef};
use crate::http_retry::send_with_retry;
use crate::net_metrics::NetMetrics;
use crate::stories::StoryFeedEntry;

/// The REST surface the core consumes. Injected so every component can
/// be exercised against a fake in tests.
#[async_trait]
pub trait PortalApi: Send + Sync {
    async fn fetch_story_feed(&self) -> Result<Vec<StoryFeedEntry>>;
    /// Best-effort view telemetry; callers swallow failures.
    async fn mark_story_viewed(&self, story_id: &str) -> Result<()>;
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;
    async fn fetch_messages(&self, peer_id: &str) -> Result<Vec<Message>>;
    async fn send_message(&self, peer_id: &str, content: &str) -> Result<Message>;
    async fn toggle_like(&self, target_id: &str, liked: bool) -> Result<()>;
    async fn toggle_follow(&self, target_id: &str, following: bool) -> Result<()>;
    async fn delete_post(&self, post_id: &str) -> Result<()>;
    async fn resolve_user(&self, user_id: &str) -> Result<UserRef>;
}

pub struct HttpPortalApi {
    base: String,
    token: String,
    http: reqwest::Client,
    net: Arc<NetMetrics>,
}

#[derive(serde::Serialize)]
struct SendMessageBody<'a> {
    receiver_id: &'a str,
    content: &'a str,
}

impl HttpPortalApi {
    pub fn new(base: &str, token: &str, http: reqwest::Client, net: Arc<NetMetrics>) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            token: token.trim().to_string(),
            http,
            net,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base))
            .header("Authorization", format!("Bearer {}", self.token))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base))
            .header("Authorization", format!("Bearer {}", self.token))
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .delete(format!("{}{path}", self.base))
            .header("Authorization", format!("Bearer {}", self.token))
    }
}

#[async_trait]
impl PortalApi for HttpPortalApi {
    async fn fetch_story_feed(&self) -> Result<Vec<StoryFeedEntry>> {
        let req = self.get("/api/v1/stories/feed");
        let resp = send_with_retry(|| req.try_clone().unwrap(), 3, &self.net).await?;
        resp.error_for_status()
            .context("story feed not ok")?
            .json::<Vec<StoryFeedEntry>>()
            .await
            .context("parse story feed")
    }

    async fn mark_story_viewed(&self, story_id: &str) -> Result<()> {
        let req = self.post(&format!("/api/v1/stories/{}/viewed", encode(story_id)));
        let resp = send_with_retry(|| req.try_clone().unwrap(), 1, &self.net).await?;
        resp.error_for_status().context("story viewed not ok")?;
        Ok(())
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        let req = self.get("/api/v1/messages/conversations");
        let resp = send_with_retry(|| req.try_clone().unwrap(), 1, &self.net).await?;
        resp.error_for_status()
            .context("conversation list not ok")?
            .json::<Vec<Conversation>>()
            .await
            .context("parse conversation list")
    }

    async fn fetch_messages(&self, peer_id: &str) -> Result<Vec<Message>> {
        let req = self.get(&format!("/api/v1/messages/history?peer={}", encode(peer_id)));
        let resp = send_with_retry(|| req.try_clone().unwrap(), 1, &self.net).await?;
        resp.error_for_status()
            .with_context(|| format!("message history not ok for {peer_id}"))?
            .json::<Vec<Message>>()
            .await
            .context("parse message history")
    }

    async fn send_message(&self, peer_id: &str, content: &str) -> Result<Message> {
        let req = self.post("/api/v1/messages/send").json(&SendMessageBody {
            receiver_id: peer_id,
            content,
        });
        let resp = send_with_retry(|| req.try_clone().unwrap(), 1, &self.net).await?;
        resp.error_for_status()
            .with_context(|| format!("send message to {peer_id} not ok"))?
            .json::<Message>()
            .await
            .context("parse sent message")
    }

    async fn toggle_like(&self, target_id: &str, liked: bool) -> Result<()> {
        let req = self
            .post(&format!("/api/v1/posts/{}/like", encode(target_id)))
            .json(&serde_json::json!({ "liked": liked }));
        let resp = send_with_retry(|| req.try_clone().unwrap(), 1, &self.net).await?;
        resp.error_for_status()
            .with_context(|| format!("toggle like not ok for {target_id}"))?;
        Ok(())
    }

    async fn toggle_follow(&self, target_id: &str, following: bool) -> Result<()> {
        let req = self
            .post(&format!("/api/v1/users/{}/follow", encode(target_id)))
            .json(&serde_json::json!({ "following": following }));
        let resp = send_with_retry(|| req.try_clone().unwrap(), 1, &self.net).await?;
        resp.error_for_status()
            .with_context(|| format!("toggle follow not ok for {target_id}"))?;
        Ok(())
    }

    async fn delete_post(&self, post_id: &str) -> Result<()> {
        let req = self.delete(&format!("/api/v1/posts/{}", encode(post_id)));
        let resp = send_with_retry(|| req.try_clone().unwrap(), 1, &self.net).await?;
        resp.error_for_status()
            .with_context(|| format!("delete post not ok for {post_id}"))?;
        Ok(())
    }

    async fn resolve_user(&self, user_id: &str) -> Result<UserRef> {
        let req = self.get(&format!("/api/v1/users/{}", encode(user_id)));
        let resp = send_with_retry(|| req.try_clone().unwrap(), 3, &self.net).await?;
        resp.error_for_status()
            .with_context(|| format!("user lookup not ok for {user_id}"))?
            .json::<UserRef>()
            .await
            .context("parse user")
    }
}
