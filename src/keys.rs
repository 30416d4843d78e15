// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::fmt;

use uuid::Uuid;

/// Identity of a single acquisition attempt.
///
/// Minted fresh for every attempt from the host name, the process id and a
/// random token, so two attempts never share one even inside one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn generate() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        OwnerId(format!(
            "{}:{}:{}",
            host,
            std::process::id(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        OwnerId(value.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(value: String) -> Self {
        OwnerId(value)
    }
}

/// Store keys and channel names for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    pub resource: String,
    /// `<prefix>:<resource>`, holds the owner id with the lease as TTL.
    pub lock: String,
    /// `<prefix>:queue:<resource>`, FIFO list of waiting owner ids.
    pub queue: String,
    /// `<prefix>:timeout:<resource>:`, suffixed by an owner id.
    pub deadline_prefix: String,
    /// `<prefix>:notify:<resource>:`, suffixed by an owner id.
    pub notify_prefix: String,
}

impl LockKeys {
    pub fn new(prefix: &str, resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            lock: format!("{prefix}:{resource}"),
            queue: format!("{prefix}:queue:{resource}"),
            deadline_prefix: format!("{prefix}:timeout:{resource}:"),
            notify_prefix: format!("{prefix}:notify:{resource}:"),
        }
    }

    pub fn deadline(&self, owner: &OwnerId) -> String {
        format!("{}{}", self.deadline_prefix, owner)
    }

    pub fn channel(&self, owner: &OwnerId) -> String {
        format!("{}{}", self.notify_prefix, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspace_layout() {
        let keys = LockKeys::new("lock", "doc:42");
        let owner = OwnerId::from("host:1:abc");

        assert_eq!(keys.lock, "lock:doc:42");
        assert_eq!(keys.queue, "lock:queue:doc:42");
        assert_eq!(keys.deadline(&owner), "lock:timeout:doc:42:host:1:abc");
        assert_eq!(keys.channel(&owner), "lock:notify:doc:42:host:1:abc");
    }

    #[test]
    fn owner_ids_are_never_reused() {
        let first = OwnerId::generate();
        let second = OwnerId::generate();

        assert_ne!(first, second);
        assert!(
            first
                .as_str()
                .contains(&format!(":{}:", std::process::id()))
        );
    }
}
