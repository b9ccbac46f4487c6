//! 内存检查点存储（测试与单机默认）
//!
//! 写锁天然保证 put 原子与同键串行。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointError, CheckpointStore, PendingWrite};

type Key = (String, String);

#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<Key, Vec<(Checkpoint, Vec<PendingWrite>)>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定键下的检查点数（测试用）
    pub async fn count(&self, thread_id: &str, namespace: &str) -> usize {
        self.threads
            .read()
            .await
            .get(&(thread_id.to_string(), namespace.to_string()))
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(
        &self,
        checkpoint: Checkpoint,
        writes: Vec<PendingWrite>,
    ) -> Result<(), CheckpointError> {
        let key = (checkpoint.thread_id.clone(), checkpoint.namespace.clone());
        let mut threads = self.threads.write().await;
        let entries = threads.entry(key).or_default();
        if entries
            .iter()
            .any(|(c, _)| c.checkpoint_id == checkpoint.checkpoint_id)
        {
            return Err(CheckpointError::IdCollision(checkpoint.checkpoint_id));
        }
        entries.push((checkpoint, writes));
        Ok(())
    }

    async fn get_latest(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(&(thread_id.to_string(), namespace.to_string()))
            .and_then(|v| v.last())
            .map(|(c, _)| c.clone()))
    }

    async fn list(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Vec<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(&(thread_id.to_string(), namespace.to_string()))
            .map(|v| v.iter().map(|(c, _)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let mut threads = self.threads.write().await;
        threads.retain(|(t, _), _| t != thread_id);
        Ok(())
    }
}
