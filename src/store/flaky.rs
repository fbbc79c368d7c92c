//! Test store that fails chosen operations on chosen key prefixes.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{IdentityStore, MemoryIdentityStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Get,
    Set,
    Del,
    Swap,
    SetIfEq,
    DelIfEq,
}

#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryIdentityStore,
    failing: Mutex<Vec<(Op, &'static str)>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail for every key starting with `prefix`.
    pub(crate) fn fail(&self, op: Op, prefix: &'static str) {
        self.failing.lock().unwrap().push((op, prefix));
    }

    pub(crate) fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub(crate) fn inner(&self) -> &MemoryIdentityStore {
        &self.inner
    }

    fn check(&self, op: Op, key: &str) -> Result<(), StoreError> {
        let failing = self.failing.lock().unwrap();
        if failing
            .iter()
            .any(|(o, prefix)| *o == op && key.starts_with(prefix))
        {
            return Err(StoreError::Backend(format!("{:?} {} refused", op, key)));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check(Op::Get, key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check(Op::Set, key)?;
        self.inner.set(key, value).await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.check(Op::Del, key)?;
        self.inner.del(key).await
    }

    async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
        self.check(Op::Swap, key)?;
        self.inner.swap(key, value).await
    }

    async fn set_if_eq(&self, key: &str, expected: &str, value: &str) -> Result<bool, StoreError> {
        self.check(Op::SetIfEq, key)?;
        self.inner.set_if_eq(key, expected, value).await
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check(Op::DelIfEq, key)?;
        self.inner.del_if_eq(key, expected).await
    }
}
