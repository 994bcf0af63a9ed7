/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};
use unilink_protocol::{ClientFrame, PushFrame};

use crate::net_metrics::NetMetrics;

/// Lifecycle and topic events observed on the push channel.
#[derive(Debug, Clone)]
pub enum ChannelSignal {
    Connected,
    Disconnected,
    Event {
        topic: String,
        payload: serde_json::Value,
    },
}

/// Bidirectional push channel, topic-addressed. Subscriptions do not
/// survive a reconnect; consumers re-assert them on `Connected`.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;
    async fn unsubscribe(&self, topic: &str) -> Result<()>;
    fn signals(&self) -> broadcast::Receiver<ChannelSignal>;
}

pub struct WsEventChannel {
    signals_tx: broadcast::Sender<ChannelSignal>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

#[async_trait]
impl EventChannel for WsEventChannel {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let _ = self.outbound.send(ClientFrame::Join {
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let _ = self.outbound.send(ClientFrame::Leave {
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals_tx.subscribe()
    }
}

impl WsEventChannel {
    /// Spawn the supervisor loop: connect, pump, reconnect with backoff
    /// until `shutdown` flips.
    pub fn start(
        ws_base: &str,
        token: &str,
        net: Arc<NetMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<WsEventChannel> {
        let (signals_tx, _) = broadcast::channel::<ChannelSignal>(256);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let channel = Arc::new(WsEventChannel {
            signals_tx: signals_tx.clone(),
            outbound: outbound_tx,
        });

        let url = format!(
            "{}/events?token={}",
            ws_base.trim_end_matches('/'),
            urlencoding::encode(token.trim())
        );
        tokio::spawn(supervise(url, signals_tx, outbound_rx, net, shutdown));
        channel
    }
}

async fn supervise(
    url: String,
    signals_tx: broadcast::Sender<ChannelSignal>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientFrame>,
    net: Arc<NetMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            break;
        }
        let ws = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() { break; }
                continue;
            }
            conn = tokio_tungstenite::connect_async(url.clone()) => conn,
        };
        let ws = match ws {
            Ok((ws, _)) => ws,
            Err(e) => {
                net.set_channel_error(e.to_string());
                debug!("channel connect failed: {e}");
                if sleep_or_shutdown(jittered(backoff), &mut shutdown).await {
                    break;
                }
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(30));
                continue;
            }
        };
        backoff = Duration::from_secs(1);

        // Frames queued while offline are stale; the consumer re-joins
        // after seeing Connected.
        while outbound_rx.try_recv().is_ok() {}

        net.set_channel_connected(true);
        info!("event channel connected");
        let _ = signals_tx.send(ChannelSignal::Connected);

        pump(ws, &signals_tx, &mut outbound_rx, &net, &mut shutdown).await;

        net.set_channel_connected(false);
        let _ = signals_tx.send(ChannelSignal::Disconnected);
        if *shutdown.borrow() {
            break;
        }
        if sleep_or_shutdown(jittered(backoff), &mut shutdown).await {
            break;
        }
        backoff = backoff.saturating_mul(2).min(Duration::from_secs(30));
    }
}

async fn pump(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    signals_tx: &broadcast::Sender<ChannelSignal>,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    net: &NetMetrics,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut ping = tokio::time::interval(Duration::from_secs(5));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() { break; }
            }
            _ = ping.tick() => {
                let payload = now_ms().to_be_bytes().to_vec();
                if let Err(e) = ws_tx.send(tungstenite::Message::Ping(payload)).await {
                    net.set_channel_error(e.to_string());
                    break;
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break; };
                let json = match serde_json::to_string(&frame) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("bad outbound frame: {e}");
                        continue;
                    }
                };
                net.channel_tx_add(json.len() as u64);
                if let Err(e) = ws_tx.send(tungstenite::Message::Text(json)).await {
                    net.set_channel_error(e.to_string());
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break; };
                let msg = match msg {
                    Ok(v) => v,
                    Err(e) => {
                        net.set_channel_error(e.to_string());
                        break;
                    }
                };
                let text = match msg {
                    tungstenite::Message::Text(t) => t,
                    tungstenite::Message::Pong(p) => {
                        if p.len() == 8 {
                            let mut a = [0u8; 8];
                            a.copy_from_slice(&p);
                            let sent_ms = u64::from_be_bytes(a);
                            net.channel_rtt_update(now_ms().saturating_sub(sent_ms));
                        }
                        continue;
                    }
                    tungstenite::Message::Ping(p) => {
                        let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                        continue;
                    }
                    tungstenite::Message::Close(_) => break,
                    _ => continue,
                };
                net.channel_rx_add(text.len() as u64);
                let frame: PushFrame = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("bad push frame json: {e}");
                        continue;
                    }
                };
                let _ = signals_tx.send(ChannelSignal::Event {
                    topic: frame.topic,
                    payload: frame.payload,
                });
            }
        }
    }
}

/// Returns true when shutdown was requested during the sleep.
async fn sleep_or_shutdown(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        res = shutdown.changed() => res.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(dur) => false,
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_ms: u64 = thread_rng().gen_range(0..=250);
    base + Duration::from_millis(jitter_ms)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
