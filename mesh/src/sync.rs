//! Post-join directory synchronization.
//!
//! A join returns as soon as the sponsor has committed the new member. The
//! rest of the directory (members the sponsor learned about from others,
//! routes) is pulled in the background; callers observe progress through a
//! [`SyncHandle`].

use std::future::Future;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing as log;

use crate::error::MeshResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    InProgress,
    Complete { members: usize, routes: usize },
    Failed { reason: String },
}

impl SyncState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, SyncState::InProgress)
    }
}

/// Observer for one synchronization run.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    rx: watch::Receiver<SyncState>,
}

impl SyncHandle {
    /// A handle for a replica that arrived complete.
    #[cfg(test)]
    pub fn complete(members: usize, routes: usize) -> Self {
        let (_tx, rx) = watch::channel(SyncState::Complete { members, routes });
        Self { rx }
    }

    pub fn state(&self) -> SyncState {
        self.rx.borrow().clone()
    }

    /// Wait for the run to finish and return its final state.
    pub async fn wait(&self) -> SyncState {
        let mut rx = self.rx.clone();
        loop {
            let state = rx.borrow_and_update().clone();
            if state.is_finished() {
                return state;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a verdict: the run was cancelled.
                return match rx.borrow().clone() {
                    SyncState::InProgress => SyncState::Failed {
                        reason: "synchronization cancelled".to_string(),
                    },
                    finished => finished,
                };
            }
        }
    }

    /// Like [`SyncHandle::wait`], returning the current state after `timeout`.
    pub async fn wait_timeout(&self, timeout: std::time::Duration) -> SyncState {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or_else(|_| self.state())
    }
}

/// Runs at most one synchronization at a time; starting a new one cancels
/// the previous run.
#[derive(Debug, Default)]
pub struct MeshSyncManager {
    current: Mutex<Option<(SyncHandle, JoinHandle<()>)>>,
}

impl MeshSyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `run`, which reports how many members and routes it merged.
    pub fn start<F>(&self, run: F) -> SyncHandle
    where
        F: Future<Output = MeshResult<(usize, usize)>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(SyncState::InProgress);
        let handle = SyncHandle { rx };
        let task = tokio::spawn(async move {
            let state = match run.await {
                Ok((members, routes)) => {
                    log::info!(
                        "Directory sync complete: {} member and {} route changes",
                        members,
                        routes
                    );
                    SyncState::Complete { members, routes }
                }
                Err(e) => {
                    log::warn!("Directory sync failed: {}", e);
                    SyncState::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            let _ = tx.send(state);
        });
        if let Some((_, previous)) = self.current.lock().replace((handle.clone(), task)) {
            previous.abort();
        }
        handle
    }

    /// The most recent run, if any.
    pub fn current(&self) -> Option<SyncHandle> {
        self.current.lock().as_ref().map(|(h, _)| h.clone())
    }

    pub fn cancel(&self) {
        if let Some((_, task)) = self.current.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::MeshError;

    #[tokio::test]
    async fn test_run_reports_completion() {
        let manager = MeshSyncManager::new();
        let handle = manager.start(async { Ok((2, 1)) });
        assert_eq!(
            handle.wait().await,
            SyncState::Complete {
                members: 2,
                routes: 1
            }
        );
        assert_eq!(manager.current().unwrap().state(), handle.state());
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let manager = MeshSyncManager::new();
        let handle = manager.start(async { Err(MeshError::Unavailable("sponsor gone".into())) });
        assert!(matches!(handle.wait().await, SyncState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_new_run_cancels_previous() {
        let manager = MeshSyncManager::new();
        let slow = manager.start(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok((0, 0))
        });
        let _fast = manager.start(async { Ok((0, 0)) });
        assert!(matches!(slow.wait().await, SyncState::Failed { .. }));
    }

    #[test]
    fn test_complete_handle() {
        let handle = SyncHandle::complete(3, 0);
        assert!(handle.state().is_finished());
    }
}
