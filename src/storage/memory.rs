use super::{ByteStream, ObjectStore};
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// 已执行的存储操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Put(String),
    Delete(String),
}

/// 进程内存储（mem://），同时记录操作顺序
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Bytes>>,
    operations: Mutex<Vec<StorageOp>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// 成功执行的操作（按顺序）
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, op: StorageOp) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    async fn put(&self, key: &str, mut stream: ByteStream) -> Result<u64> {
        let mut data = BytesMut::new();
        while let Some(chunk) = stream.try_next().await? {
            data.extend_from_slice(&chunk);
        }

        let written = data.len() as u64;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data.freeze());
        self.record(StorageOp::Put(key.to_string()));
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.record(StorageOp::Delete(key.to_string()));
        Ok(())
    }

    fn name(&self) -> &str {
        "mem://"
    }
}
