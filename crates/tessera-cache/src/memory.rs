use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{VolatileError, VolatileStore};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-process volatile backend for single-node deployments and tests.
///
/// Lists and keyed values live in dashmaps; expiry is enforced lazily on
/// access, which is enough because every TTL'd key is re-checked before use
/// (leases on acquire, idempotency entries on lookup).
#[derive(Default)]
pub struct MemoryStore {
    lists: DashMap<String, VecDeque<String>>,
    values: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VolatileStore for MemoryStore {
    async fn push_right(&self, key: &str, value: &str) -> Result<(), VolatileError> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn push_left(&self, key: &str, value: &str) -> Result<(), VolatileError> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn pop_left(&self, key: &str) -> Result<Option<String>, VolatileError> {
        Ok(self
            .lists
            .get_mut(key)
            .and_then(|mut list| list.pop_front()))
    }

    async fn list_len(&self, key: &str) -> Result<u64, VolatileError> {
        Ok(self.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn list_contains(&self, key: &str, value: &str) -> Result<bool, VolatileError> {
        Ok(self
            .lists
            .get(key)
            .is_some_and(|list| list.iter().any(|v| v.as_str() == value)))
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, VolatileError> {
        let lease = Entry {
            value: b"1".to_vec(),
            expires_at: Some(Instant::now() + ttl),
        };
        match self.values.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().expired() {
                    occupied.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), VolatileError> {
        self.values.remove(key);
        Ok(())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), VolatileError> {
        self.values.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), VolatileError> {
        self.values.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, VolatileError> {
        if let Some(entry) = self.values.get(key) {
            if entry.expired() {
                drop(entry);
                self.values.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_left_preserves_push_order() {
        let store = MemoryStore::new();
        for id in ["1", "2", "3"] {
            store.push_right("q", id).await.unwrap();
        }
        assert_eq!(store.list_len("q").await.unwrap(), 3);
        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.pop_left("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reverse_push_left_restores_drain_order() {
        let store = MemoryStore::new();
        for id in ["1", "2", "3"] {
            store.push_right("q", id).await.unwrap();
        }
        let mut drained = Vec::new();
        while let Some(id) = store.pop_left("q").await.unwrap() {
            drained.push(id);
        }
        for id in drained.iter().rev() {
            store.push_left("q", id).await.unwrap();
        }
        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn list_contains_sees_only_current_elements() {
        let store = MemoryStore::new();
        store.push_right("q", "41").await.unwrap();
        assert!(store.list_contains("q", "41").await.unwrap());
        assert!(!store.list_contains("q", "42").await.unwrap());
        store.pop_left("q").await.unwrap();
        assert!(!store.list_contains("q", "41").await.unwrap());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        assert!(store.try_acquire("lock:chat:1", ttl).await.unwrap());
        assert!(!store.try_acquire("lock:chat:1", ttl).await.unwrap());
        store.release("lock:chat:1").await.unwrap();
        assert!(store.try_acquire("lock:chat:1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let store = MemoryStore::new();
        assert!(store
            .try_acquire("lock:chat:1", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store
            .try_acquire("lock:chat:1", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ttl_value_expires_but_plain_value_does_not() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("idemp:K", b"17", Duration::from_millis(10))
            .await
            .unwrap();
        store.set("chat:1:latest_root", b"root").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("idemp:K").await.unwrap(), None);
        assert_eq!(
            store.get("chat:1:latest_root").await.unwrap().as_deref(),
            Some(b"root".as_slice())
        );
    }
}
