//! Process-local key/value backend
//!
//! Keeps values, sets and lists in ordered maps behind one lock. Used when
//! `storage.backend = "memory"` and as the storage double in tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use apolo_core::error::AppError;
use apolo_core::traits::KvStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

#[derive(Default)]
struct Inner {
    values: BTreeMap<String, String>,
    sets: BTreeMap<String, BTreeSet<String>>,
    lists: BTreeMap<String, VecDeque<String>>,
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        inner.values.clear();
        inner.sets.clear();
        inner.lists.clear();
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.inner.read().values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        debug!("SET {}", key);
        self.inner
            .write()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.write();
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        inner.values.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        debug!("DEL {}", key);
        let mut inner = self.inner.write();
        let removed = inner.values.remove(key).is_some()
            | inner.sets.remove(key).is_some()
            | inner.lists.remove(key).is_some();
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let inner = self.inner.read();
        Ok(inner.values.contains_key(key)
            || inner.sets.contains_key(key)
            || inner.lists.contains_key(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        let inner = self.inner.read();
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .chain(inner.sets.keys())
            .chain(inner.lists.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, AppError> {
        Ok(self
            .inner
            .write()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.write();
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            inner.sets.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, AppError> {
        Ok(self
            .inner
            .read()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.inner
            .write()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut inner = self.inner.write();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let head = list.pop_front();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(head)
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values() {
        let store = MemoryStore::new();
        store.set("a:1", "one").await.unwrap();
        assert_eq!(store.get("a:1").await.unwrap().as_deref(), Some("one"));
        assert!(!store.set_nx("a:1", "uno").await.unwrap());
        assert!(store.set_nx("a:2", "two").await.unwrap());
        assert!(store.exists("a:2").await.unwrap());
        assert!(store.delete("a:2").await.unwrap());
        assert!(!store.delete("a:2").await.unwrap());
        assert_eq!(store.get("a:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = MemoryStore::new();
        store.set("rpl:t1:B", "{}").await.unwrap();
        store.set("rpl:t1:A", "{}").await.unwrap();
        store.set("rpl:t2:C", "{}").await.unwrap();
        store.sadd("rpl:t1:S", "x").await.unwrap();
        assert_eq!(
            store.keys("rpl:t1:").await.unwrap(),
            vec!["rpl:t1:A", "rpl:t1:B", "rpl:t1:S"]
        );
    }

    #[tokio::test]
    async fn test_set_operations() {
        let store = MemoryStore::new();
        assert!(store.sadd("s", "member2").await.unwrap());
        assert!(store.sadd("s", "member1").await.unwrap());
        assert!(!store.sadd("s", "member1").await.unwrap());
        assert_eq!(store.smembers("s").await.unwrap(), vec!["member1", "member2"]);
        assert!(store.srem("s", "member1").await.unwrap());
        assert!(!store.srem("s", "member3").await.unwrap());
        assert!(store.srem("s", "member2").await.unwrap());
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_fifo() {
        let store = MemoryStore::new();
        store.rpush("q", "1").await.unwrap();
        store.rpush("q", "2").await.unwrap();
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.lpop("q").await.unwrap(), None);
        store.flush();
        assert!(store.keys("").await.unwrap().is_empty());
    }
}
