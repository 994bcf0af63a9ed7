/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::channel::{ChannelSignal, EventChannel};

pub type RefreshFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Subscribes topics on the event channel and maps each pushed event to
/// the owning component's full-refresh entry point. Payloads are partial
/// and untrusted, so they are never patched into local state.
pub struct NotificationFanout {
    channel: Arc<dyn EventChannel>,
    triggers: Vec<(String, RefreshFn)>,
}

impl NotificationFanout {
    pub fn new(channel: Arc<dyn EventChannel>) -> Self {
        Self {
            channel,
            triggers: Vec::new(),
        }
    }

    pub fn on_topic(mut self, topic: &str, refresh: RefreshFn) -> Self {
        self.triggers.push((topic.to_string(), refresh));
        self
    }

    /// Spawn the consumer loop. Topic subscriptions are re-asserted on
    /// every `Connected`: the transport does not carry them across a
    /// reconnect.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) {
        let Self { channel, triggers } = self;
        let mut signals = channel.signals();
        tokio::spawn(async move {
            for (topic, _) in &triggers {
                let _ = channel.subscribe(topic).await;
            }
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    sig = signals.recv() => {
                        match sig {
                            Ok(ChannelSignal::Connected) => {
                                for (topic, _) in &triggers {
                                    let _ = channel.subscribe(topic).await;
                                }
                            }
                            Ok(ChannelSignal::Disconnected) => {
                                // Polling components self-heal; push-only
                                // refreshes stay stale until reconnect.
                            }
                            Ok(ChannelSignal::Event { topic, .. }) => {
                                match triggers.iter().find(|(t, _)| *t == topic) {
                                    Some((_, refresh)) => refresh().await,
                                    None => debug!("ignoring event on topic {topic}"),
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("fanout lagged behind {n} channel signals");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }
}
