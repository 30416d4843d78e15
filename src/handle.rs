// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{BoxError, FairLockError, LockStatus},
    heartbeat::{Heartbeat, LeaseState},
    keys::{LockKeys, OwnerId},
    providers::Lease,
    store::{ExtendOutcome, LockStore, ReleaseOutcome, now_millis},
};

/// Result of an acquisition: a held lock, or a sentinel that holds nothing.
///
/// Releasing is always safe, whichever variant was returned, so callers can
/// write acquire, use, release without checking the outcome first.
#[derive(Debug)]
#[must_use = "dropping the handle releases the lock"]
pub enum LockHandle {
    Held(HeldLock),
    /// Acquisition failed and the caller asked not to get an error.
    Noop { resource: String, status: LockStatus },
}

impl LockHandle {
    pub(crate) fn noop(resource: &str, status: LockStatus) -> Self {
        LockHandle::Noop {
            resource: resource.to_string(),
            status,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, LockHandle::Held(_))
    }

    pub fn status(&self) -> LockStatus {
        match self {
            LockHandle::Held(_) => LockStatus::Acquired,
            LockHandle::Noop { status, .. } => *status,
        }
    }

    pub fn resource(&self) -> &str {
        match self {
            LockHandle::Held(held) => held.lease.resource(),
            LockHandle::Noop { resource, .. } => resource,
        }
    }

    /// Owner id of the held lock.
    pub fn owner(&self) -> Option<&str> {
        match self {
            LockHandle::Held(held) => Some(held.lease.owner()),
            LockHandle::Noop { .. } => None,
        }
    }

    /// Whether the extension loop found the lock taken by someone else.
    pub fn is_lost(&self) -> bool {
        match self {
            LockHandle::Held(held) => held.heartbeat.state() == LeaseState::Lost,
            LockHandle::Noop { .. } => false,
        }
    }

    /// Resolves once ownership is lost. Never resolves for a sentinel handle
    /// or a lock that is released normally.
    pub async fn lost(&self) {
        match self {
            LockHandle::Held(held) => held.heartbeat.lost().await,
            LockHandle::Noop { .. } => std::future::pending().await,
        }
    }

    /// Stop renewing and give the lock up.
    ///
    /// Only the first call does anything, even when several tasks release
    /// the same handle concurrently. A release that finds the lock owned by
    /// someone else is not an error. If the store call fails the handle stays
    /// releasable, so the caller may retry and dropping it tries again.
    pub async fn release(&self) -> Result<(), FairLockError> {
        match self {
            LockHandle::Held(held) => held.release().await,
            LockHandle::Noop { .. } => Ok(()),
        }
    }
}

/// A lock held by this process together with its extension loop.
#[derive(Debug)]
pub struct HeldLock {
    lease: Arc<dyn Lease>,
    heartbeat: Heartbeat,
    released: AtomicBool,
}

impl HeldLock {
    pub(crate) fn start(
        lease: Arc<dyn Lease>,
        extend_every: Duration,
        cancel: &CancellationToken,
    ) -> Self {
        let heartbeat = Heartbeat::spawn(Arc::clone(&lease), extend_every, cancel);
        Self {
            lease,
            heartbeat,
            released: AtomicBool::new(false),
        }
    }

    async fn release(&self) -> Result<(), FairLockError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.heartbeat.stop().await;
        if let Err(error) = self.lease.release().await {
            // Leave the lock releasable by a retry or by drop
            self.released.store(false, Ordering::Release);
            return Err(error.into());
        }
        debug!(resource = self.lease.resource(), owner = self.lease.owner(), "lock released");
        Ok(())
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.heartbeat.cancel();
        let lease = Arc::clone(&self.lease);
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = lease.release().await {
                        warn!(resource = lease.resource(), %error, "release on drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    resource = lease.resource(),
                    "handle dropped outside a runtime, lock will expire with its lease"
                );
            }
        }
    }
}

/// Lease on a lock taken through the fair queue.
#[derive(Debug)]
pub(crate) struct FairLease {
    store: Arc<dyn LockStore>,
    keys: LockKeys,
    owner: OwnerId,
    lease: Duration,
}

impl FairLease {
    pub(crate) fn new(
        store: Arc<dyn LockStore>,
        keys: LockKeys,
        owner: OwnerId,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            owner,
            lease,
        }
    }
}

#[async_trait]
impl Lease for FairLease {
    fn resource(&self) -> &str {
        &self.keys.resource
    }

    fn owner(&self) -> &str {
        self.owner.as_str()
    }

    async fn renew(&self) -> Result<ExtendOutcome, BoxError> {
        self.store.extend(&self.keys, &self.owner, self.lease).await
    }

    async fn release(&self) -> Result<(), BoxError> {
        let outcome = self
            .store
            .release(&self.keys, &self.owner, self.lease, now_millis())
            .await?;
        if outcome == ReleaseOutcome::NotOwner {
            debug!(resource = %self.keys.resource, owner = %self.owner, "release of a lock held by another owner ignored");
        }
        Ok(())
    }
}
