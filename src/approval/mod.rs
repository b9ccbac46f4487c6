//! 人工审批门
//!
//! 进程级审批请求注册表。每个 pending 请求持有一个单次触发的完成信号（latch），
//! 等待方阻塞其上；approve / reject / expire 均为终态，终态之间不再迁移，
//! 重复解决幂等返回当前记录。跨会话操作返回 Forbidden。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::core::AgentError;
use crate::observability::Metrics;

/// 审批状态机：pending -> approved | rejected | expired（均为终态）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        *self != ApprovalStatus::Pending
    }
}

/// 审批请求记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub action_type: String,
    pub action_description: String,
    pub action_data: serde_json::Value,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub reviewer_comment: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// 单次触发完成信号：unresolved -> resolved 恰好一次，唤醒所有等待方
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// 触发；仅第一次调用返回 true
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// 等待触发；超时返回 false
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return *rx.borrow();
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {
                    if *rx.borrow() {
                        return true;
                    }
                }
                // 发送端丢弃或超时
                Ok(Err(_)) | Err(_) => return *rx.borrow(),
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

struct ApprovalEntry {
    request: ApprovalRequest,
    latch: Arc<Latch>,
}

/// 审批门：create / wait / approve / reject / list_pending / sweep_expired
pub struct ApprovalGate {
    entries: RwLock<HashMap<String, ApprovalEntry>>,
    default_ttl: Duration,
}

impl ApprovalGate {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// 创建 pending 请求；expires_at = now + ttl（未指定时用默认 TTL）
    pub async fn create(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        action_type: &str,
        action_description: &str,
        action_data: serde_json::Value,
        ttl: Option<Duration>,
    ) -> ApprovalRequest {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.map(String::from),
            action_type: action_type.to_string(),
            action_description: action_description.to_string(),
            action_data,
            status: ApprovalStatus::Pending,
            created_at: now,
            resolved_at: None,
            reviewer_comment: None,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
        };

        Metrics::global().approvals.created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(
            request_id = %request.id,
            session_id = %session_id,
            action_type = %action_type,
            "approval_request_created"
        );

        self.entries.write().await.insert(
            request.id.clone(),
            ApprovalEntry {
                request: request.clone(),
                latch: Arc::new(Latch::new()),
            },
        );
        request
    }

    /// 阻塞等待信号或超时；超时返回当前状态（可能仍是 pending）
    pub async fn wait(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<ApprovalRequest, AgentError> {
        let latch = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(request_id)
                .ok_or_else(|| AgentError::NotFound(format!("approval request {}", request_id)))?;
            Arc::clone(&entry.latch)
        };

        latch.wait(timeout).await;

        let entries = self.entries.read().await;
        entries
            .get(request_id)
            .map(|e| e.request.clone())
            .ok_or_else(|| AgentError::NotFound(format!("approval request {}", request_id)))
    }

    pub async fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.entries
            .read()
            .await
            .get(request_id)
            .map(|e| e.request.clone())
    }

    /// approve；非 pending 时幂等返回当前记录
    pub async fn approve(
        &self,
        session_id: &str,
        request_id: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, AgentError> {
        self.resolve(session_id, request_id, ApprovalStatus::Approved, comment)
            .await
    }

    /// reject；非 pending 时幂等返回当前记录
    pub async fn reject(
        &self,
        session_id: &str,
        request_id: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, AgentError> {
        self.resolve(session_id, request_id, ApprovalStatus::Rejected, comment)
            .await
    }

    async fn resolve(
        &self,
        session_id: &str,
        request_id: &str,
        target: ApprovalStatus,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, AgentError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(request_id)
            .ok_or_else(|| AgentError::NotFound(format!("approval request {}", request_id)))?;

        if entry.request.session_id != session_id {
            return Err(AgentError::Forbidden(format!(
                "approval request {} belongs to another session",
                request_id
            )));
        }

        // 终态不再迁移：幂等返回当前记录
        if entry.request.status.is_terminal() {
            return Ok(entry.request.clone());
        }

        entry.request.status = target;
        entry.request.resolved_at = Some(Utc::now());
        entry.request.reviewer_comment = comment.map(String::from);
        entry.latch.fire();

        let metrics = Metrics::global();
        match target {
            ApprovalStatus::Approved => {
                metrics.approvals.approved.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::info!(request_id = %request_id, "approval_request_approved");
            }
            ApprovalStatus::Rejected => {
                metrics.approvals.rejected.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::info!(request_id = %request_id, "approval_request_rejected");
            }
            _ => {}
        }

        Ok(entry.request.clone())
    }

    /// 列出 pending 请求（可按会话过滤）；顺带清扫过期项
    pub async fn list_pending(&self, session_id: Option<&str>) -> Vec<ApprovalRequest> {
        self.sweep_expired().await;
        let entries = self.entries.read().await;
        let mut pending: Vec<ApprovalRequest> = entries
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .filter(|e| session_id.map(|s| e.request.session_id == s).unwrap_or(true))
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// 过期清扫：pending 且 now > expires_at 的迁移为 expired 并触发信号
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let mut swept = 0;
        for entry in entries.values_mut() {
            if entry.request.status == ApprovalStatus::Pending && entry.request.expires_at < now {
                entry.request.status = ApprovalStatus::Expired;
                entry.request.resolved_at = Some(now);
                entry.latch.fire();
                swept += 1;
            }
        }
        if swept > 0 {
            Metrics::global()
                .approvals
                .expired
                .fetch_add(swept as u64, std::sync::atomic::Ordering::Relaxed);
            tracing::info!(count = swept, "approval_requests_expired");
        }
        swept
    }

    /// 已解决请求的垃圾回收（保留 pending）
    pub async fn gc_resolved(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.request.status == ApprovalStatus::Pending);
        before - entries.len()
    }
}

/// 周期清扫任务；返回句柄供优雅停机
pub fn spawn_sweeper(gate: Arc<ApprovalGate>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            gate.sweep_expired().await;
        }
    })
}
