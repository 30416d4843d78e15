// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    fmt::Debug,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};

use crate::{
    error::BoxError,
    keys::{LockKeys, OwnerId},
};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "redis")]
pub(crate) mod scripts;

/// Result of a TryAcquire invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Queued,
    /// The caller's own queue deadline lapsed; its slot is gone.
    Expired,
}

/// Result of an Extend invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// The caller still owned the record and its TTL was refreshed.
    Applied,
    /// The record had lapsed and was recreated for the caller.
    Reclaimed,
    /// Somebody else holds the lock now.
    Rejected,
}

/// Result of a Release invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The record belongs to another owner; nothing was touched.
    NotOwner,
}

/// `LockStore` abstracts the atomic procedures that are the only writers of
/// lock, queue and deadline keys.
///
/// Every method must execute as a single atomic unit against the store: no
/// other invocation touching the same resource may interleave with it.
#[async_trait]
pub trait LockStore: Debug + Send + Sync {
    /// Purge expired waiters, then take the lock, join the queue, or report
    /// that the caller's queue deadline has lapsed.
    async fn try_acquire(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        wait: Duration,
        lease: Duration,
        now: u64,
    ) -> Result<AcquireOutcome, BoxError>;

    /// Refresh the lease of a held lock.
    async fn extend(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        lease: Duration,
    ) -> Result<ExtendOutcome, BoxError>;

    /// Purge expired waiters, drop the lock if the caller owns it (or nobody
    /// does) and wake the next waiter.
    async fn release(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        lease: Duration,
        now: u64,
    ) -> Result<ReleaseOutcome, BoxError>;

    /// Listen on a wakeup channel. Dropping the subscription unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BoxError>;
}

/// A live subscription to one wakeup channel.
pub struct Subscription {
    messages: BoxStream<'static, ()>,
    closed: bool,
}

impl Subscription {
    pub fn new(messages: impl Stream<Item = ()> + Send + 'static) -> Self {
        Self {
            messages: messages.boxed(),
            closed: false,
        }
    }

    /// Wait for the next wakeup.
    ///
    /// Once the underlying stream ends this never resolves, leaving callers
    /// to their fallback delay.
    pub async fn notified(&mut self) {
        if !self.closed {
            if self.messages.next().await.is_some() {
                return;
            }
            self.closed = true;
        }
        std::future::pending::<()>().await
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Wall clock in epoch milliseconds, the unit of queue deadlines.
pub fn now_millis() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    millis(since_epoch)
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Latest queue deadline a store will record. Lua numbers are doubles, so
/// deadlines stay within the range of exactly representable integers.
pub(crate) const MAX_DEADLINE: u64 = (1 << 53) - 1;

/// Queue wait in milliseconds, capped so `now + wait` never passes
/// [MAX_DEADLINE].
pub(crate) fn wait_millis(wait: Duration, now: u64) -> u64 {
    millis(wait).min(MAX_DEADLINE.saturating_sub(now))
}
