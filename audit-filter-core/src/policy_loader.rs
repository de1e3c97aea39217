//! Policy loading and hot-reload (spec.md §4.6), grounded on
//! `pkg/filter/filter.go`'s `LoadPolicy`/`pkg/reader/reader.go`'s
//! `WatchPolicyPath`.
//!
//! The active policy is held behind `RwLock<Arc<Policy>>` rather than the
//! source's raw pointer swap (spec.md §9's "atomic snapshot" design note):
//! a reader takes one `Arc` clone per event and sees a fully consistent
//! policy even if a reload lands mid-decision.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::policy::Policy;

/// Shared handle to the current policy; clone freely, each holder sees a
/// consistent `Arc<Policy>` snapshot per `current()` call.
#[derive(Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<Policy>>>,
}

impl PolicyHandle {
    pub fn new(initial: Policy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub async fn current(&self) -> Arc<Policy> {
        self.inner.read().await.clone()
    }

    async fn swap(&self, policy: Policy) {
        *self.inner.write().await = Arc::new(policy);
    }
}

/// Loads the policy at `path`; on parse failure (or a missing file) falls
/// back to the built-in default, matching the original's "never fail
/// startup over a bad policy file" behavior.
pub fn load_initial(path: &Path) -> (Policy, Option<crate::error::AuditFilterError>) {
    match Policy::load_from_file(path) {
        Ok(policy) => (policy, None),
        Err(e) => (Policy::default_policy(), Some(e)),
    }
}

/// Spawns a watcher on `path`, its parent, and its grandparent directory
/// (to tolerate atomic-symlink-swap configmap mounts), re-parsing and
/// swapping the active policy on every filesystem event. Parse failures
/// retain the previous policy and are logged, never propagated.
pub fn spawn_watcher(path: PathBuf, handle: PolicyHandle) -> crate::error::Result<tokio::task::JoinHandle<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = build_watcher(&path, tx)?;
    // Keep the watcher alive for the lifetime of the spawned task.
    let join = tokio::spawn(async move {
        let _watcher_guard = &mut watcher;
        while let Some(()) = rx.recv().await {
            match Policy::load_from_file(&path) {
                Ok(policy) => {
                    info!(path = %path.display(), "policy reloaded");
                    handle.swap(policy).await;
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "policy reload failed, keeping previous policy");
                }
            }
        }
    });
    Ok(join)
}

fn build_watcher(path: &Path, tx: mpsc::UnboundedSender<()>) -> crate::error::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    if let Some(parent) = path.parent() {
        if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
            warn!(dir = %parent.display(), error = %e, "policy watcher: couldn't watch parent directory");
        }
        if let Some(grandparent) = parent.parent() {
            if let Err(e) = watcher.watch(grandparent, RecursiveMode::NonRecursive) {
                warn!(dir = %grandparent.display(), error = %e, "policy watcher: couldn't watch grandparent directory");
            }
        }
    }
    Ok(watcher)
}
