// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{error::BoxError, store::ExtendOutcome};

#[cfg(feature = "redis")]
pub mod redis;

/// `Provider` is a trait that abstracts a general purpose, non-fair lock
/// backend used by [FairLock::acquire](crate::FairLock::acquire).
///
/// Waiters are not queued: whoever asks first after the lock frees up wins.
#[async_trait]
pub trait Provider: Debug + Send + Sync {
    /// Try to take `resource` for `expiry`, retrying for up to `wait`.
    ///
    /// Returns `None` when the lock could not be taken in time or the attempt
    /// was cancelled.
    async fn acquire(
        &self,
        resource: &str,
        expiry: Duration,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn Lease>>, BoxError>;
}

/// `Lease` is a trait that abstracts the backend specific details of the
/// lock renewal and release mechanism.
#[async_trait]
pub trait Lease: Debug + Send + Sync {
    fn resource(&self) -> &str;

    fn owner(&self) -> &str;

    async fn renew(&self) -> Result<ExtendOutcome, BoxError>;

    /// Give the lock up. Releasing a lock that is no longer owned is not an
    /// error.
    async fn release(&self) -> Result<(), BoxError>;
}
