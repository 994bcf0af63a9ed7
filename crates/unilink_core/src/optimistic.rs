/*
 * SPDX-FileCopyrightText: 2026 UniLink Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

use crate::ui_events::{self, UiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Follow,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditStatus {
    Pending,
    Confirmed,
    RolledBack,
}

/// One speculative edit: the state shown to the user before the server
/// confirmed it, plus the exact state to restore on failure.
#[derive(Debug, Clone)]
pub struct OptimisticEdit<T> {
    pub target_id: String,
    pub prior: T,
    pub speculative: T,
    pub status: EditStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EditKey {
    kind: InteractionKind,
    target_id: String,
}

/// Apply-now, confirm-or-rollback-later. At most one pending edit per
/// (kind, target): a second apply on a pending target is rejected so the
/// prior-state capture is never ambiguous.
pub struct Mutations {
    ui: broadcast::Sender<UiEvent>,
    edits: Arc<Mutex<HashMap<EditKey, EditStatus>>>,
}

impl Mutations {
    pub fn new(ui: broadcast::Sender<UiEvent>) -> Self {
        Self {
            ui,
            edits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Install `speculative` synchronously, then commit in the
    /// background. On rejection `prior` is reinstalled exactly and one
    /// failure notice is broadcast. Never blocks, never retries.
    pub fn apply<T, S, C, Fut>(
        &self,
        kind: InteractionKind,
        target_id: &str,
        prior: T,
        speculative: T,
        install: S,
        commit: C,
    ) -> Result<()>
    where
        T: Clone + Send + 'static,
        S: Fn(T) + Send + 'static,
        C: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let key = EditKey {
            kind,
            target_id: target_id.to_string(),
        };
        {
            let mut edits = self.edits.lock().unwrap();
            if matches!(edits.get(&key), Some(EditStatus::Pending)) {
                anyhow::bail!("{kind:?} already pending for {target_id}");
            }
            edits.insert(key.clone(), EditStatus::Pending);
        }

        let mut edit = OptimisticEdit {
            target_id: target_id.to_string(),
            prior,
            speculative,
            status: EditStatus::Pending,
        };
        install(edit.speculative.clone());

        let edits = Arc::clone(&self.edits);
        let ui = self.ui.clone();
        tokio::spawn(async move {
            match commit().await {
                Ok(()) => {
                    // Speculative state is now truth; nothing to do.
                    edit.status = EditStatus::Confirmed;
                    edits.lock().unwrap().insert(key, EditStatus::Confirmed);
                }
                Err(e) => {
                    warn!(
                        "{:?} commit failed for {}: {e:#}",
                        key.kind, key.target_id
                    );
                    install(edit.prior.clone());
                    edit.status = EditStatus::RolledBack;
                    edits
                        .lock()
                        .unwrap()
                        .insert(key.clone(), EditStatus::RolledBack);
                    let _ = ui.send(UiEvent::new(
                        ui_events::KIND_MUTATION_FAILED,
                        None,
                        Some(key.target_id),
                    ));
                }
            }
        });
        Ok(())
    }

    /// Status of the most recent edit for this target, if any.
    pub fn status(&self, kind: InteractionKind, target_id: &str) -> Option<EditStatus> {
        let key = EditKey {
            kind,
            target_id: target_id.to_string(),
        };
        self.edits.lock().unwrap().get(&key).copied()
    }
}

/// Like/unlike visible state: a flag plus its counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub liked: bool,
    pub count: u32,
}

impl LikeState {
    pub fn toggled(&self) -> LikeState {
        if self.liked {
            LikeState {
                liked: false,
                count: self.count.saturating_sub(1),
            }
        } else {
            LikeState {
                liked: true,
                count: self.count + 1,
            }
        }
    }
}

/// Prior/speculative list pair for an optimistic delete. Rolling back
/// reinstalls the prior list, which puts the item back at its original
/// index rather than appending it.
pub fn remove_at<T: Clone>(list: &[T], index: usize) -> Option<(Vec<T>, Vec<T>)> {
    if index >= list.len() {
        return None;
    }
    let prior = list.to_vec();
    let mut speculative = list.to_vec();
    speculative.remove(index);
    Some((prior, speculative))
}
