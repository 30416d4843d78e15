// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use futures::StreamExt;
use redis::{Client, RedisError, Script, aio::ConnectionManager};
use tracing::{debug, trace};

use crate::{
    error::BoxError,
    keys::{LockKeys, OwnerId},
    store::{
        AcquireOutcome, ExtendOutcome, LockStore, ReleaseOutcome, Subscription, millis, scripts,
        wait_millis,
    },
};

/// [Redis](redis) backed [LockStore].
///
/// Procedures run as Lua scripts (sent with `EVALSHA`, falling back to
/// `EVAL` on a cold script cache). Wakeups use a dedicated pub/sub connection
/// per subscription.
#[derive(Builder, Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    #[builder(skip)]
    scripts: Arc<Scripts>,
}

struct Scripts {
    try_acquire: Script,
    extend: Script,
    release: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            try_acquire: Script::new(scripts::TRY_ACQUIRE),
            extend: Script::new(scripts::EXTEND),
            release: Script::new(scripts::RELEASE),
        }
    }
}

impl RedisStore {
    /// Open a client for `url` and a managed connection on it.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self::builder().client(client).connection(connection).build())
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for RedisStore {
    async fn try_acquire(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        wait: Duration,
        lease: Duration,
        now: u64,
    ) -> Result<AcquireOutcome, BoxError> {
        let mut connection = self.connection.clone();
        let code: i64 = self
            .scripts
            .try_acquire
            .key(&keys.lock)
            .key(&keys.queue)
            .arg(owner.as_str())
            .arg(&keys.deadline_prefix)
            .arg(wait_millis(wait, now))
            .arg(millis(lease).max(1))
            .arg(now)
            .invoke_async(&mut connection)
            .await?;

        trace!(resource = %keys.resource, %owner, code, "try acquire");
        match code {
            1 => Ok(AcquireOutcome::Acquired),
            0 => Ok(AcquireOutcome::Queued),
            -1 => Ok(AcquireOutcome::Expired),
            other => Err(format!("unexpected try acquire reply {other}").into()),
        }
    }

    async fn extend(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        lease: Duration,
    ) -> Result<ExtendOutcome, BoxError> {
        let mut connection = self.connection.clone();
        let code: i64 = self
            .scripts
            .extend
            .key(&keys.lock)
            .arg(owner.as_str())
            .arg(millis(lease).max(1))
            .invoke_async(&mut connection)
            .await?;

        match code {
            1 => Ok(ExtendOutcome::Applied),
            2 => Ok(ExtendOutcome::Reclaimed),
            0 => Ok(ExtendOutcome::Rejected),
            other => Err(format!("unexpected extend reply {other}").into()),
        }
    }

    async fn release(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        lease: Duration,
        now: u64,
    ) -> Result<ReleaseOutcome, BoxError> {
        let mut connection = self.connection.clone();
        let code: i64 = self
            .scripts
            .release
            .key(&keys.lock)
            .key(&keys.queue)
            .arg(owner.as_str())
            .arg(&keys.deadline_prefix)
            .arg(&keys.notify_prefix)
            .arg(millis(lease))
            .arg(now)
            .invoke_async(&mut connection)
            .await?;

        match code {
            1 => Ok(ReleaseOutcome::Released),
            0 => Ok(ReleaseOutcome::NotOwner),
            other => Err(format!("unexpected release reply {other}").into()),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BoxError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "subscribed to wakeup channel");

        Ok(Subscription::new(pubsub.into_on_message().map(|_| ())))
    }
}
