//! SQLite 检查点存储（sqlx）
//!
//! 检查点行与 checkpoint_writes 在同一事务内写入，读方只会看到一致快照。
//! sessions 表维护会话元信息，供外层 CRUD 查询。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{Checkpoint, CheckpointError, CheckpointStore, PendingWrite};

pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

fn store_err(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Unavailable(e.to_string())
}

impl SqliteCheckpointStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(store_err)?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_tables(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                namespace TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                parent_checkpoint_id TEXT,
                channel_values TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (thread_id, namespace, checkpoint_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoint_writes (
                thread_id TEXT NOT NULL,
                namespace TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                channel TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (thread_id, namespace, checkpoint_id, task_id, idx)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                created_at INTEGER NOT NULL,
                name TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_key ON checkpoints(thread_id, namespace)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// 会话元信息 upsert
    pub async fn record_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        name: Option<&str>,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, user_id, created_at, name) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint, CheckpointError> {
        let payload: String = row.get("channel_values");
        let channel_values = serde_json::from_str(&payload)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
        Ok(Checkpoint {
            thread_id: row.get("thread_id"),
            namespace: row.get("namespace"),
            checkpoint_id: row.get("checkpoint_id"),
            parent_checkpoint_id: row.get("parent_checkpoint_id"),
            channel_values,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(
        &self,
        checkpoint: Checkpoint,
        writes: Vec<PendingWrite>,
    ) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO checkpoints
                (thread_id, namespace, checkpoint_id, parent_checkpoint_id, channel_values, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.namespace)
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.parent_checkpoint_id)
        .bind(checkpoint.channel_values.to_string())
        .bind(checkpoint.created_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if inserted.rows_affected() == 0 {
            return Err(CheckpointError::IdCollision(checkpoint.checkpoint_id));
        }

        for w in &writes {
            sqlx::query(
                "INSERT INTO checkpoint_writes
                    (thread_id, namespace, checkpoint_id, task_id, idx, channel, value)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&checkpoint.thread_id)
            .bind(&checkpoint.namespace)
            .bind(&checkpoint.checkpoint_id)
            .bind(&w.task_id)
            .bind(w.idx)
            .bind(&w.channel)
            .bind(w.value.to_string())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn get_latest(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            "SELECT thread_id, namespace, checkpoint_id, parent_checkpoint_id, channel_values, created_at
             FROM checkpoints WHERE thread_id = ? AND namespace = ?
             ORDER BY rowid DESC LIMIT 1",
        )
        .bind(thread_id)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row.map(|r| Self::row_to_checkpoint(&r)).transpose()
    }

    async fn list(
        &self,
        thread_id: &str,
        namespace: &str,
    ) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT thread_id, namespace, checkpoint_id, parent_checkpoint_id, channel_values, created_at
             FROM checkpoints WHERE thread_id = ? AND namespace = ?
             ORDER BY rowid ASC",
        )
        .bind(thread_id)
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_checkpoint).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
