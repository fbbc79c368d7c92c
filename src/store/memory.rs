use async_trait::async_trait;
use dashmap::DashMap;

use super::{IdentityStore, StoreError};

/// In-process identity store backed by a DashMap.
///
/// Every operation holds the shard lock for its key, so `swap` and
/// `del_if_eq` are atomic without extra coordination.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    entries: DashMap<String, String>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.insert(key.to_string(), value.to_string()))
    }

    async fn set_if_eq(&self, key: &str, expected: &str, value: &str) -> Result<bool, StoreError> {
        match self.entries.get_mut(key) {
            Some(mut current) if current.value() == expected => {
                *current = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .remove_if(key, |_, current| current == expected)
            .is_some())
    }
}
