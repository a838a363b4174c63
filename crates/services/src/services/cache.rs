//! Injected key-value store shared by locks, mode/pause caches, and the
//! global kill-switch. The relational store stays ground truth for durable
//! state; entries here are TTL-bound accelerators and coordination keys.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set only if the key is absent (or expired). Returns whether the
    /// write happened. This is the lock-acquire primitive.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Delete iff the stored value equals `expected`. Returns whether a
    /// live entry was removed. This is the lock-release primitive; the
    /// compare and the delete must be atomic in any implementation.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Remaining time-to-live, `None` for a missing key or one without
    /// expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    /// Live keys starting with `prefix`. Used for lock anomaly counting.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store backed by a concurrent map. Serves single-node
/// deployments and every test; expiry is checked lazily on access.
#[derive(Default)]
pub struct MemoryKv {
    entries: DashMap<String, KvEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Drop expired entries on the read path.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.insert(key.to_string(), KvEntry::new(value, ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(KvEntry::new(value, Some(ttl)));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(KvEntry::new(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, entry| {
                !entry.is_expired(now) && entry.value == expected
            })
            .is_some();
        Ok(removed)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let now = Instant::now();
        let remaining = self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .filter(|at| *at > now)
                .map(|at| at - now)
        });
        Ok(remaining)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        let keys = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_holds_until_expiry() {
        let kv = MemoryKv::new();

        assert!(kv.set_nx("k", "a", Duration::from_millis(20)).await.unwrap());
        assert!(!kv.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(kv.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_requires_matching_value() {
        let kv = MemoryKv::new();
        kv.set("k", "token-1", None).await.unwrap();

        assert!(!kv.compare_and_delete("k", "token-2").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("token-1"));

        assert!(kv.compare_and_delete("k", "token-1").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.compare_and_delete("k", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn prefix_scan_skips_expired_entries() {
        let kv = MemoryKv::new();
        kv.set("ns:a:lock", "1", Some(Duration::from_millis(10))).await.unwrap();
        kv.set("ns:b:lock", "1", None).await.unwrap();
        kv.set("other:c", "1", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let keys = kv.keys_with_prefix("ns:").await.unwrap();
        assert_eq!(keys, vec!["ns:b:lock".to_string()]);
    }
}
