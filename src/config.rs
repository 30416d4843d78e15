// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every lock created through a [FairLock](crate::FairLock).
///
/// Durations are kept in milliseconds so the struct can be embedded in any
/// serde based configuration file as plain integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FairLockConfig {
    /// Prefix of every key and channel in the store.
    pub key_prefix: String,
    /// Lease granted to a lock record on acquisition and on every renewal.
    pub expiry_ms: u64,
    /// Timeout used when a caller passes none, zero, or an unbounded one.
    pub min_timeout_ms: u64,
    /// Period of the lease extension loop. Defaults to a third of the lease.
    pub extend_interval_ms: Option<u64>,
}

impl Default for FairLockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock".to_string(),
            expiry_ms: 30_000,
            min_timeout_ms: 10_000,
            extend_interval_ms: None,
        }
    }
}

impl FairLockConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms.max(1))
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_millis(self.min_timeout_ms)
    }

    pub fn extend_interval(&self) -> Duration {
        let interval = match self.extend_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.expiry() / 3,
        };
        interval.max(Duration::from_millis(1))
    }

    /// Replace a missing, zero, or unbounded timeout with the configured floor.
    pub fn clamp_timeout(&self, timeout: Option<Duration>) -> Duration {
        match timeout {
            Some(timeout) if !timeout.is_zero() && timeout != Duration::MAX => timeout,
            _ => self.min_timeout(),
        }
    }
}
