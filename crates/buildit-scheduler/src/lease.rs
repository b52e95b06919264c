//! Exclusive access to a project's workspace.
//!
//! Polls, wipes and non-concurrent builds take the lease exclusively.
//! Concurrent builds share it with each other but never with a poll.
//! Waiters are served in FIFO order. Every guard releases on drop and
//! wakes the build queue's dispatcher.

use buildit_core::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::storage::remove_dir_if_exists;

/// Snapshot of who holds a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "holder", rename_all = "snake_case")]
pub enum LeaseHolder {
    None,
    Poll,
    Build { numbers: BTreeSet<u32> },
    Wipe,
}

#[derive(Debug, Default)]
struct Holders {
    poll: bool,
    wipe: bool,
    builds: BTreeSet<u32>,
    /// Build leases taken before their number was allocated.
    starting: usize,
}

enum Hold {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

#[derive(Debug, Clone, Copy)]
enum Purpose {
    Poll,
    Wipe,
    Build(u32),
    Starting,
}

pub struct WorkspaceLease {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
    holders: Arc<Mutex<Holders>>,
    released: Arc<Notify>,
}

impl WorkspaceLease {
    pub fn new(path: PathBuf, released: Arc<Notify>) -> Self {
        Self {
            path,
            lock: Arc::new(RwLock::new(())),
            holders: Arc::new(Mutex::new(Holders::default())),
            released,
        }
    }

    /// Workspace directory guarded by this lease.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> LeaseHolder {
        let holders = self.holders.lock();
        if holders.wipe {
            LeaseHolder::Wipe
        } else if holders.poll {
            LeaseHolder::Poll
        } else if !holders.builds.is_empty() || holders.starting > 0 {
            LeaseHolder::Build {
                numbers: holders.builds.clone(),
            }
        } else {
            LeaseHolder::None
        }
    }

    /// Wait for exclusive access for a change-detection pass.
    pub async fn acquire_for_poll(&self, cancel: &CancellationToken) -> Result<LeaseGuard> {
        let hold = self.exclusive(cancel).await?;
        Ok(self.guard(hold, Purpose::Poll))
    }

    /// Wait for access to run build `number`.
    pub async fn acquire_for_build(
        &self,
        number: u32,
        concurrent: bool,
        cancel: &CancellationToken,
    ) -> Result<LeaseGuard> {
        let hold = if concurrent {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                guard = self.lock.clone().read_owned() => Hold::Shared(guard),
            }
        } else {
            self.exclusive(cancel).await?
        };
        Ok(self.guard(hold, Purpose::Build(number)))
    }

    /// Take the build lease without waiting. The returned guard is bound
    /// to a build number once one has been allocated.
    pub fn try_acquire_for_build(&self, concurrent: bool) -> Option<PendingBuildLease> {
        let hold = if concurrent {
            Hold::Shared(self.lock.clone().try_read_owned().ok()?)
        } else {
            Hold::Exclusive(self.lock.clone().try_write_owned().ok()?)
        };
        Some(PendingBuildLease {
            guard: self.guard(hold, Purpose::Starting),
        })
    }

    /// Delete the workspace while holding the lease exclusively.
    pub async fn wipe(&self, cancel: &CancellationToken) -> Result<()> {
        let hold = self.exclusive(cancel).await?;
        let _guard = self.guard(hold, Purpose::Wipe);
        let path = self.path.clone();
        let removed = tokio::task::spawn_blocking(move || remove_dir_if_exists(&path))
            .await
            .map_err(|e| Error::Internal(format!("wipe task failed: {e}")))??;
        debug!(path = %self.path.display(), removed, "Wiped workspace");
        Ok(())
    }

    async fn exclusive(&self, cancel: &CancellationToken) -> Result<Hold> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = self.lock.clone().write_owned() => Ok(Hold::Exclusive(guard)),
        }
    }

    fn guard(&self, hold: Hold, purpose: Purpose) -> LeaseGuard {
        {
            let mut holders = self.holders.lock();
            match purpose {
                Purpose::Poll => holders.poll = true,
                Purpose::Wipe => holders.wipe = true,
                Purpose::Build(number) => {
                    holders.builds.insert(number);
                }
                Purpose::Starting => holders.starting += 1,
            }
        }
        debug!(path = %self.path.display(), ?purpose, "Lease acquired");
        LeaseGuard {
            hold: Some(hold),
            purpose,
            holders: self.holders.clone(),
            released: self.released.clone(),
        }
    }
}

/// Held workspace lease. Dropping it releases the lease.
pub struct LeaseGuard {
    hold: Option<Hold>,
    purpose: Purpose,
    holders: Arc<Mutex<Holders>>,
    released: Arc<Notify>,
}

impl LeaseGuard {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.hold, Some(Hold::Exclusive(_)))
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        {
            let mut holders = self.holders.lock();
            match self.purpose {
                Purpose::Poll => holders.poll = false,
                Purpose::Wipe => holders.wipe = false,
                Purpose::Build(number) => {
                    holders.builds.remove(&number);
                }
                Purpose::Starting => holders.starting = holders.starting.saturating_sub(1),
            }
        }
        self.hold.take();
        debug!(purpose = ?self.purpose, "Lease released");
        // An unbound build lease never made anything available that was not
        // available before it was taken.
        if !matches!(self.purpose, Purpose::Starting) {
            self.released.notify_waiters();
        }
    }
}

/// Build lease held before the build number is known.
pub struct PendingBuildLease {
    guard: LeaseGuard,
}

impl PendingBuildLease {
    pub fn bind(mut self, number: u32) -> LeaseGuard {
        {
            let mut holders = self.guard.holders.lock();
            holders.starting = holders.starting.saturating_sub(1);
            holders.builds.insert(number);
        }
        self.guard.purpose = Purpose::Build(number);
        self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn lease(path: PathBuf) -> WorkspaceLease {
        WorkspaceLease::new(path, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn test_poll_excludes_build() {
        let dir = tempdir().unwrap();
        let lease = lease(dir.path().join("ws"));
        let cancel = CancellationToken::new();

        let poll = lease.acquire_for_poll(&cancel).await.unwrap();
        assert_eq!(lease.holder(), LeaseHolder::Poll);
        assert!(lease.try_acquire_for_build(false).is_none());
        assert!(lease.try_acquire_for_build(true).is_none());

        drop(poll);
        assert_eq!(lease.holder(), LeaseHolder::None);
        let build = lease.try_acquire_for_build(false).unwrap().bind(1);
        assert!(build.is_exclusive());
        assert_eq!(
            lease.holder(),
            LeaseHolder::Build {
                numbers: BTreeSet::from([1])
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_builds_share_but_exclude_poll() {
        let dir = tempdir().unwrap();
        let lease = lease(dir.path().join("ws"));
        let cancel = CancellationToken::new();

        let first = lease.acquire_for_build(1, true, &cancel).await.unwrap();
        let second = lease.acquire_for_build(2, true, &cancel).await.unwrap();
        assert!(lease.try_acquire_for_build(false).is_none());

        let poll = tokio::time::timeout(Duration::from_millis(50), lease.acquire_for_poll(&cancel)).await;
        assert!(poll.is_err(), "poll must wait for builders");

        drop(first);
        drop(second);
        let poll = lease.acquire_for_poll(&cancel).await.unwrap();
        assert!(poll.is_exclusive());
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_nothing_held() {
        let dir = tempdir().unwrap();
        let lease = Arc::new(lease(dir.path().join("ws")));
        let cancel = CancellationToken::new();

        let build = lease.acquire_for_build(1, false, &cancel).await.unwrap();

        let waiter = {
            let lease = lease.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lease.acquire_for_poll(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));

        drop(build);
        assert_eq!(lease.holder(), LeaseHolder::None);
        assert!(lease.try_acquire_for_build(false).is_some());
    }

    #[tokio::test]
    async fn test_release_notifies_dispatcher() {
        let dir = tempdir().unwrap();
        let released = Arc::new(Notify::new());
        let lease = WorkspaceLease::new(dir.path().join("ws"), released.clone());

        let guard = lease.try_acquire_for_build(false).unwrap().bind(3);
        let notified = released.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);
        tokio::time::timeout(Duration::from_millis(100), notified)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wipe_removes_workspace() {
        let dir = tempdir().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(ws.join("sub")).unwrap();
        std::fs::write(ws.join("sub/file"), "x").unwrap();

        let lease = lease(ws.clone());
        let cancel = CancellationToken::new();
        lease.wipe(&cancel).await.unwrap();
        assert!(!ws.exists());

        // No workspace yet is fine.
        lease.wipe(&cancel).await.unwrap();
    }
}
