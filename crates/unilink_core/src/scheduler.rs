/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Cancellation handle for a scheduled timer. Dropping the handle cancels
/// the timer, so a handle must stay owned for as long as ticks should fire.
pub struct TimerHandle {
    cancel: watch::Sender<bool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

/// Run `f` once after `delay`, unless cancelled first.
pub fn run_after<F, Fut>(delay: Duration, f: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = rx.changed() => {}
            _ = tokio::time::sleep(delay) => {
                f().await;
            }
        }
    });
    TimerHandle { cancel: tx }
}

/// Run `f` every `period`, first firing one full period from now. Each
/// firing runs to completion before the next tick is observed, so ticks
/// for one timer never overlap.
pub fn run_every<F, Fut>(period: Duration, mut f: F) -> TimerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, mut rx) = watch::channel(false);
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut tick = tokio::time::interval_at(start, period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                res = rx.changed() => {
                    if res.is_err() || *rx.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    f().await;
                }
            }
        }
    });
    TimerHandle { cancel: tx }
}

/// Holder for at most one live timer. Arming cancels whatever was armed
/// before, which is what keeps navigation and polling code from ever
/// holding two concurrent timers for the same session.
#[derive(Default)]
pub struct TimerSlot {
    live: Option<TimerHandle>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_after<F, Fut>(&mut self, delay: Duration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.live = Some(run_after(delay, f));
    }

    pub fn arm_every<F, Fut>(&mut self, period: Duration, f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.live = Some(run_every(period, f));
    }

    pub fn disarm(&mut self) {
        if let Some(handle) = self.live.take() {
            handle.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.live.is_some()
    }
}
