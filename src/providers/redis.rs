// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use redis::{Script, aio::ConnectionManager};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::BoxError,
    keys::OwnerId,
    providers::{Lease, Provider},
    store::{ExtendOutcome, millis, scripts},
};

/// [Redis](redis) provider for the non-fair lock path.
///
/// A plain `SET NX PX` lock on `<prefix>:simple:<resource>`, polled every
/// `retry` until the caller's wait budget runs out.
#[derive(Builder, Clone)]
pub struct RedisProvider {
    connection: ConnectionManager,
    #[builder(default = "lock".to_string(), into)]
    key_prefix: String,
    #[builder(default = Duration::from_millis(50))]
    retry: Duration,
}

impl RedisProvider {
    fn key(&self, resource: &str) -> String {
        format!("{}:simple:{}", self.key_prefix, resource)
    }
}

impl fmt::Debug for RedisProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisProvider")
            .field("key_prefix", &self.key_prefix)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Provider for RedisProvider {
    async fn acquire(
        &self,
        resource: &str,
        expiry: Duration,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn Lease>>, BoxError> {
        let key = self.key(resource);
        let owner = OwnerId::generate();
        let script = Script::new(scripts::SIMPLE_ACQUIRE);
        let started = tokio::time::Instant::now();
        let mut connection = self.connection.clone();

        loop {
            let acquired: i64 = script
                .key(&key)
                .arg(owner.as_str())
                .arg(millis(expiry).max(1))
                .invoke_async(&mut connection)
                .await?;

            if acquired == 1 {
                debug!(resource, %owner, "acquired simple lock");
                return Ok(Some(Arc::new(RedisLease {
                    resource: resource.to_string(),
                    key,
                    owner,
                    expiry,
                    connection,
                })));
            }

            let remaining = wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }

            select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = sleep(self.retry.min(remaining)) => {}
            }
        }
    }
}

/// Lease on a lock taken through [RedisProvider].
pub struct RedisLease {
    resource: String,
    key: String,
    owner: OwnerId,
    expiry: Duration,
    connection: ConnectionManager,
}

impl fmt::Debug for RedisLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLease")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Lease for RedisLease {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn owner(&self) -> &str {
        self.owner.as_str()
    }

    async fn renew(&self) -> Result<ExtendOutcome, BoxError> {
        let mut connection = self.connection.clone();
        let renewed: i64 = Script::new(scripts::SIMPLE_EXTEND)
            .key(&self.key)
            .arg(self.owner.as_str())
            .arg(millis(self.expiry).max(1))
            .invoke_async(&mut connection)
            .await?;

        Ok(if renewed == 1 {
            ExtendOutcome::Applied
        } else {
            ExtendOutcome::Rejected
        })
    }

    async fn release(&self) -> Result<(), BoxError> {
        let mut connection = self.connection.clone();
        let deleted: i64 = Script::new(scripts::SIMPLE_RELEASE)
            .key(&self.key)
            .arg(self.owner.as_str())
            .invoke_async(&mut connection)
            .await?;

        if deleted == 0 {
            debug!(resource = %self.resource, owner = %self.owner, "simple lock was no longer ours");
        }
        Ok(())
    }
}
