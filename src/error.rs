// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{error::Error, fmt, time::Duration};

use thiserror::Error as ThisError;

/// Boxed error returned by stores and providers.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Where a single acquisition attempt ended up. An attempt still waiting in
/// the queue has not returned yet, so it has no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockStatus {
    /// The lock is held by this attempt.
    Acquired,
    /// The attempt's own queue deadline lapsed before it reached the head.
    Expired,
    /// The timeout elapsed without the lock being acquired.
    NotAcquired,
    /// The caller cancelled the attempt while it was waiting.
    Cancelled,
}

impl LockStatus {
    pub fn is_acquired(self) -> bool {
        self == LockStatus::Acquired
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockStatus::Acquired => "acquired",
            LockStatus::Expired => "expired",
            LockStatus::NotAcquired => "not acquired",
            LockStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(ThisError, Debug)]
pub enum FairLockError {
    #[error("store error: {0}")]
    StoreError(#[from] BoxError),

    #[error("provider error: {0}")]
    ProviderError(BoxError),

    #[error("lock `{resource}` {status} after {elapsed:?}")]
    NotAcquired {
        status: LockStatus,
        resource: String,
        elapsed: Duration,
    },

    #[error("no lock provider configured")]
    NoProvider,
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for FairLockError {
    fn from(error: redis::RedisError) -> Self {
        FairLockError::StoreError(Box::new(error))
    }
}

impl FairLockError {
    /// Status carried by a failed acquisition, if this is one.
    pub fn status(&self) -> Option<LockStatus> {
        match self {
            FairLockError::NotAcquired { status, .. } => Some(*status),
            _ => None,
        }
    }
}
