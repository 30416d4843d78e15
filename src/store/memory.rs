// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;

use crate::{
    error::BoxError,
    keys::{LockKeys, OwnerId},
    store::{
        AcquireOutcome, ExtendOutcome, LockStore, ReleaseOutcome, Subscription, wait_millis,
    },
};

const CHANNEL_CAPACITY: usize = 16;

/// In-process [LockStore] with the same semantics as the Redis scripts.
///
/// The whole keyspace sits behind one mutex held for the duration of each
/// procedure, which gives the same atomicity a server-side script has. Clones
/// share the keyspace, so one `MemoryStore` can stand in for a shared store
/// between many [FairLock](crate::FairLock) instances in one process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
}

#[derive(Debug, Default)]
struct Keyspace {
    strings: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
    channels: HashMap<String, broadcast::Sender<()>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Keyspace {
    fn get(&mut self, key: &str) -> Option<String> {
        let expired = match self.strings.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= Instant::now()),
            None => return None,
        };
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key).map(|entry| entry.value.clone())
    }

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.strings
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        if let Some(entry) = self.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn del(&mut self, key: &str) {
        self.strings.remove(key);
    }

    fn head(&self, key: &str) -> Option<String> {
        self.lists.get(key).and_then(|list| list.front().cloned())
    }

    fn pop_head(&mut self, key: &str) {
        if let Some(list) = self.lists.get_mut(key) {
            list.pop_front();
            if list.is_empty() {
                self.lists.remove(key);
            }
        }
    }

    fn push_tail(&mut self, key: &str, value: String) {
        self.lists.entry(key.to_string()).or_default().push_back(value);
    }

    fn publish(&mut self, channel: &str) {
        if let Some(sender) = self.channels.get(channel) {
            if sender.send(()).is_err() {
                self.channels.remove(channel);
            }
        }
    }

    /// Drop queue heads whose deadline is missing or already reached.
    fn purge(&mut self, keys: &LockKeys, now: u64) {
        while let Some(head) = self.head(&keys.queue) {
            let deadline_key = format!("{}{}", keys.deadline_prefix, head);
            match self.get(&deadline_key) {
                None => {
                    trace!(waiter = %head, "purging orphaned queue entry");
                    self.pop_head(&keys.queue);
                }
                Some(deadline) if now >= parse_deadline(&deadline) => {
                    trace!(waiter = %head, "purging expired queue entry");
                    self.del(&deadline_key);
                    self.pop_head(&keys.queue);
                }
                Some(_) => break,
            }
        }
    }
}

fn parse_deadline(value: &str) -> u64 {
    value.parse().unwrap_or(0)
}

fn lock_keyspace(keyspace: &Mutex<Keyspace>) -> MutexGuard<'_, Keyspace> {
    // A panic while holding the guard cannot leave a procedure half
    // applied in a way later calls would misread, so keep going.
    keyspace
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receiving end of a wakeup channel. Removes the channel from the keyspace
/// once its last listener goes away.
struct Listener {
    receiver: broadcast::Receiver<()>,
    channel: String,
    keyspace: Weak<Mutex<Keyspace>>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        let Some(keyspace) = self.keyspace.upgrade() else {
            return;
        };
        let mut keyspace = lock_keyspace(&keyspace);
        // Our own receiver is still alive here
        if keyspace
            .channels
            .get(&self.channel)
            .is_some_and(|sender| sender.receiver_count() <= 1)
        {
            keyspace.channels.remove(&self.channel);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        lock_keyspace(&self.keyspace)
    }

    /// Current holder of the resource, if any.
    pub fn holder(&self, keys: &LockKeys) -> Option<String> {
        self.keyspace().get(&keys.lock)
    }

    /// Waiting owner ids, head first.
    pub fn queue(&self, keys: &LockKeys) -> Vec<String> {
        self.keyspace()
            .lists
            .get(&keys.queue)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue deadline of a waiter in epoch milliseconds.
    pub fn deadline(&self, keys: &LockKeys, owner: &OwnerId) -> Option<u64> {
        self.keyspace()
            .get(&keys.deadline(owner))
            .map(|deadline| parse_deadline(&deadline))
    }

    /// Remaining time to live of the lock record.
    pub fn lease_remaining(&self, keys: &LockKeys) -> Option<Duration> {
        let mut keyspace = self.keyspace();
        keyspace.get(&keys.lock)?;
        keyspace
            .strings
            .get(&keys.lock)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of wakeup channels that still have a listener or a pending
    /// sender.
    pub fn open_channels(&self) -> usize {
        self.keyspace().channels.len()
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        wait: Duration,
        lease: Duration,
        now: u64,
    ) -> Result<AcquireOutcome, BoxError> {
        let mut keyspace = self.keyspace();
        keyspace.purge(keys, now);

        let deadline_key = keys.deadline(owner);
        if keyspace.get(&keys.lock).is_none() {
            let head = keyspace.head(&keys.queue);
            if head.as_deref().is_none_or(|head| head == owner.as_str()) {
                if head.is_some() {
                    keyspace.pop_head(&keys.queue);
                }
                keyspace.del(&deadline_key);
                keyspace.set(&keys.lock, owner.to_string(), Some(lease));
                return Ok(AcquireOutcome::Acquired);
            }
        }

        match keyspace.get(&deadline_key) {
            Some(deadline) if now >= parse_deadline(&deadline) => {
                keyspace.del(&deadline_key);
                Ok(AcquireOutcome::Expired)
            }
            Some(_) => Ok(AcquireOutcome::Queued),
            None => {
                keyspace.push_tail(&keys.queue, owner.to_string());
                let deadline = now.saturating_add(wait_millis(wait, now));
                keyspace.set(&deadline_key, deadline.to_string(), None);
                Ok(AcquireOutcome::Queued)
            }
        }
    }

    async fn extend(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        lease: Duration,
    ) -> Result<ExtendOutcome, BoxError> {
        let mut keyspace = self.keyspace();
        match keyspace.get(&keys.lock) {
            None => {
                keyspace.set(&keys.lock, owner.to_string(), Some(lease));
                Ok(ExtendOutcome::Reclaimed)
            }
            Some(holder) if holder == owner.as_str() => {
                keyspace.expire(&keys.lock, lease);
                Ok(ExtendOutcome::Applied)
            }
            Some(_) => Ok(ExtendOutcome::Rejected),
        }
    }

    async fn release(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        _lease: Duration,
        now: u64,
    ) -> Result<ReleaseOutcome, BoxError> {
        let mut keyspace = self.keyspace();
        keyspace.purge(keys, now);

        match keyspace.get(&keys.lock) {
            Some(holder) if holder != owner.as_str() => Ok(ReleaseOutcome::NotOwner),
            _ => {
                keyspace.del(&keys.lock);
                if let Some(next) = keyspace.head(&keys.queue) {
                    keyspace.publish(&format!("{}{}", keys.notify_prefix, next));
                }
                Ok(ReleaseOutcome::Released)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BoxError> {
        let receiver = self
            .keyspace()
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let listener = Listener {
            receiver,
            channel: channel.to_string(),
            keyspace: Arc::downgrade(&self.keyspace),
        };

        let messages = stream::unfold(listener, |mut listener| async move {
            match listener.receiver.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => Some(((), listener)),
                Err(RecvError::Closed) => None,
            }
        });
        Ok(Subscription::new(messages))
    }
}
