//! 检查点存储
//!
//! 按 (thread_id, namespace) 保存严格增长的检查点序列；检查点以 (id, parent_id?)
//! 父指针形成树，最新一条是恢复点。put 必须原子：检查点行与全部 pending_writes
//! 要么同时可见要么都不可见。

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::AgentState;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// 存储不可用（瞬态）；调用方应将当前步骤视为未完成
    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("Checkpoint id collision: {0}")]
    IdCollision(String),

    #[error("Corrupt checkpoint payload: {0}")]
    Corrupt(String),
}

/// 单个检查点：会话状态在一次循环边界的快照
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub namespace: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    /// 状态快照（JSON）
    pub channel_values: serde_json::Value,
    /// Unix 毫秒
    pub created_at: i64,
}

impl Checkpoint {
    pub fn new(
        thread_id: impl Into<String>,
        namespace: impl Into<String>,
        parent: Option<String>,
        channel_values: serde_json::Value,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: namespace.into(),
            checkpoint_id: Uuid::new_v4().to_string(),
            parent_checkpoint_id: parent,
            channel_values,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// 检查点的通道写入（本步骤产生的增量）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
    pub value: serde_json::Value,
}

/// 存储契约：put 原子、同键 put 串行、不同 thread 并行
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 原子插入检查点及其通道写入；checkpoint_id 冲突时失败
    async fn put(
        &self,
        checkpoint: Checkpoint,
        writes: Vec<PendingWrite>,
    ) -> Result<(), CheckpointError>;

    /// 最新检查点；失败时调用方按「无历史」处理
    async fn get_latest(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError>;

    /// 按插入顺序列出
    async fn list(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// 删除线程的全部检查点（显式会话移除时）
    async fn delete_thread(&self, thread_id: &str) -> Result<(), CheckpointError>;
}

/// 将 AgentState 序列化为 channel_values
pub fn snapshot_state(state: &AgentState) -> serde_json::Value {
    serde_json::json!({
        "messages": state.messages,
        "metadata": state.metadata,
    })
}

/// 从 channel_values 恢复 AgentState；损坏时返回 Corrupt
pub fn restore_state(value: &serde_json::Value) -> Result<AgentState, CheckpointError> {
    let messages = value
        .get("messages")
        .cloned()
        .ok_or_else(|| CheckpointError::Corrupt("missing messages".to_string()))?;
    let metadata = value
        .get("metadata")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    Ok(AgentState {
        messages: serde_json::from_value(messages)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?,
        metadata: serde_json::from_value(metadata).unwrap_or_default(),
    })
}
