// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

//! A fair, lease based distributed lock
//!
//! FairLock lets unrelated processes sharing one key/value store coordinate
//! exclusive access to a named resource. Waiters are served first come first
//! served through a queue kept in the store, and a held lock has its lease
//! renewed in the background until it is released.
//!
//! All lock state lives in the store and is only ever changed by three atomic
//! procedures (see [LockStore]): try acquire, extend and release. A waiter is
//! woken through a per-attempt pub/sub channel when the lock frees up, and
//! falls back to polling in case a wakeup is missed.
//!
//! # Examples
//!
//! You can let `FairLock` scope the critical section for you or manage the
//! handle yourself:
//!
//! ## Scoped
//! [FairLock::with] will acquire, automatically renew, and release the lock.
//! ```rust,no_run
//! use fairlock::{FairLock, RedisStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisStore::connect("redis://127.0.0.1/").await.unwrap();
//!     let lock = FairLock::builder().store(Arc::new(store)).build();
//!
//!     let result = lock
//!         .with("doc:42", Some(Duration::from_secs(5)), async |_handle| {
//!             // do synchronized work!
//!         })
//!         .await;
//! }
//! ```
//!
//! ## Manually
//! You are responsible for releasing the handle.
//! ```rust,no_run
//! use fairlock::{FairLock, RedisStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisStore::connect("redis://127.0.0.1/").await.unwrap();
//!     let lock = FairLock::builder().store(Arc::new(store)).build();
//!     let cancel = CancellationToken::new();
//!
//!     let handle = lock
//!         .acquire_fair("doc:42", Some(Duration::from_secs(5)), false, &cancel)
//!         .await
//!         .unwrap();
//!     if handle.is_acquired() {
//!         // do synchronized work!
//!     }
//!     handle.release().await.unwrap();
//! }
//! ```

use std::{sync::Arc, time::Duration};
pub mod config;
pub mod error;
mod handle;
mod heartbeat;
pub mod keys;
pub mod providers;
pub mod store;

use bon::Builder;
use tokio::{
    select,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, instrument, trace};

use crate::{
    error::{FairLockError, LockStatus},
    handle::FairLease,
    keys::{LockKeys, OwnerId},
    store::{AcquireOutcome, now_millis},
};

pub use config::FairLockConfig;
pub use handle::{HeldLock, LockHandle};
pub use heartbeat::LeaseState;
#[cfg(feature = "redis")]
pub use providers::redis::{RedisLease, RedisProvider};
pub use providers::{Lease, Provider};
pub use store::{LockStore, memory::MemoryStore};
#[cfg(feature = "redis")]
pub use store::redis::RedisStore;

/// Shortest fallback delay between two attempts of a queued waiter.
const MIN_POLL: Duration = Duration::from_millis(1);

#[derive(Builder, Debug, Clone)]
pub struct FairLock {
    store: Arc<dyn LockStore>,
    #[builder(default)]
    config: FairLockConfig,
    /// Backend of the non-fair [FairLock::acquire] path.
    provider: Option<Arc<dyn Provider>>,
}

/// How an attempt that had to queue ended.
enum Waited {
    Acquired,
    Expired,
    TimedOut,
    Cancelled,
}

impl FairLock {
    pub fn config(&self) -> &FairLockConfig {
        &self.config
    }

    /// Acquire a lock through the fair queue.
    ///
    /// Waits for up to `timeout` (clamped to the configured floor when it is
    /// missing, zero or unbounded). On success the returned handle keeps the
    /// lease renewed until it is released or `cancel` fires.
    ///
    /// When the lock cannot be acquired in time this returns
    /// [FairLockError::NotAcquired] if `throw_on_failure` is set, and a
    /// [LockHandle::Noop] otherwise. Cancellation is always reported as an
    /// error with [LockStatus::Cancelled]: the caller asked to stop waiting,
    /// so a sentinel it would go on to use is never handed back.
    ///
    /// <div class="warning">
    /// A cancelled waiter's queue entry is not removed eagerly. It is purged
    /// by a later call on the same resource once its deadline has passed,
    /// delaying the waiters behind it until then.
    /// </div>
    #[instrument(skip(self, cancel), fields(owner))]
    pub async fn acquire_fair(
        &self,
        resource: &str,
        timeout: Option<Duration>,
        throw_on_failure: bool,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, FairLockError> {
        let timeout = self.config.clamp_timeout(timeout);
        let owner = OwnerId::generate();
        Span::current().record("owner", owner.as_str());
        let keys = LockKeys::new(&self.config.key_prefix, resource);
        let started = Instant::now();

        let status = match self.try_acquire(&keys, &owner, timeout).await? {
            AcquireOutcome::Acquired => LockStatus::Acquired,
            AcquireOutcome::Expired => LockStatus::Expired,
            AcquireOutcome::Queued => {
                trace!("queued");
                match self.wait(&keys, &owner, timeout, started, cancel).await? {
                    Waited::Acquired => LockStatus::Acquired,
                    Waited::Expired => LockStatus::Expired,
                    Waited::TimedOut => LockStatus::NotAcquired,
                    Waited::Cancelled => {
                        debug!("cancelled while queued");
                        return Err(FairLockError::NotAcquired {
                            status: LockStatus::Cancelled,
                            resource: resource.to_string(),
                            elapsed: started.elapsed(),
                        });
                    }
                }
            }
        };

        if status.is_acquired() {
            debug!(waited = ?started.elapsed(), "acquired");
            let lease = FairLease::new(
                Arc::clone(&self.store),
                keys,
                owner,
                self.config.expiry(),
            );
            return Ok(LockHandle::Held(HeldLock::start(
                Arc::new(lease),
                self.config.extend_interval(),
                cancel,
            )));
        }

        let elapsed = started.elapsed();
        debug!(%status, ?elapsed, "not acquired");
        if throw_on_failure {
            Err(FairLockError::NotAcquired {
                status,
                resource: resource.to_string(),
                elapsed,
            })
        } else {
            Ok(LockHandle::noop(resource, status))
        }
    }

    /// Acquire a lock through the configured non-fair [Provider].
    ///
    /// There is no queue: whichever caller retries first after the lock frees
    /// up gets it.
    #[instrument(skip(self, cancel))]
    pub async fn acquire(
        &self,
        resource: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, FairLockError> {
        let provider = self.provider.as_ref().ok_or(FairLockError::NoProvider)?;
        let timeout = self.config.clamp_timeout(timeout);
        let started = Instant::now();

        let lease = provider
            .acquire(resource, self.config.expiry(), timeout, cancel)
            .await
            .map_err(FairLockError::ProviderError)?;

        match lease {
            Some(lease) => {
                debug!(owner = lease.owner(), "acquired");
                Ok(LockHandle::Held(HeldLock::start(
                    lease,
                    self.config.extend_interval(),
                    cancel,
                )))
            }
            None => {
                let status = if cancel.is_cancelled() {
                    LockStatus::Cancelled
                } else {
                    LockStatus::NotAcquired
                };
                Err(FairLockError::NotAcquired {
                    status,
                    resource: resource.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    /// Execute a closure while holding the lock.
    ///
    /// The lock is acquired through the fair queue, kept renewed while the
    /// closure runs, and released afterwards. The closure gets the handle so
    /// it can watch for [LockHandle::lost].
    ///
    /// <div class="warning">
    /// The lease is renewed by a background task. If the closure outlives the
    /// lease because the renewals failed, the handle reports it as lost but
    /// the closure is not interrupted.
    /// </div>
    pub async fn with<R>(
        &self,
        resource: &str,
        timeout: Option<Duration>,
        f: impl AsyncFnOnce(&LockHandle) -> R,
    ) -> Result<R, FairLockError> {
        let cancel = CancellationToken::new();
        let handle = self.acquire_fair(resource, timeout, true, &cancel).await?;

        let result = f(&handle).await;

        handle.release().await?;
        Ok(result)
    }

    async fn try_acquire(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        timeout: Duration,
    ) -> Result<AcquireOutcome, FairLockError> {
        Ok(self
            .store
            .try_acquire(keys, owner, timeout, self.config.expiry(), now_millis())
            .await?)
    }

    async fn wait(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        timeout: Duration,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<Waited, FairLockError> {
        // Dropped on every return, which unsubscribes
        let mut wakeups = self.store.subscribe(&keys.channel(owner)).await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(Waited::Cancelled);
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Ok(Waited::TimedOut);
            }

            match self.try_acquire(keys, owner, timeout).await? {
                AcquireOutcome::Acquired => return Ok(Waited::Acquired),
                AcquireOutcome::Expired => return Ok(Waited::Expired),
                AcquireOutcome::Queued => {}
            }

            select! {
                _ = cancel.cancelled() => {}
                _ = wakeups.notified() => trace!("woken up"),
                _ = sleep((remaining / 3).max(MIN_POLL)) => {}
            }
        }
    }
}
