//! Agent 错误类型
//!
//! 按四类组织：Transient（重试后以 UpstreamUnavailable 浮出）、Permanent（立即失败）、
//! Policy（CycleCapExceeded / PlanStuck，以消息 + 事件形式呈现在最终状态）、Cancelled。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（上游、校验、权限、检查点、取消等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 瞬态错误重试耗尽（模型环所有后端均失败）
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Schema / 参数 / 计划 JSON 校验失败
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// 角色不足或跨会话操作
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// 单次请求循环数超过 cycle_cap
    #[error("Cycle cap exceeded after {0} cycles")]
    CycleCapExceeded(usize),

    /// 工作流轮数超上限仍有未完成步骤（依赖规划有误）
    #[error("Workflow plan stuck after {0} rounds")]
    PlanStuck(usize),

    /// 检查点存储不可用；当前步骤视为未完成
    #[error("Checkpoint store unavailable: {0}")]
    CheckpointUnavailable(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 是否为瞬态类错误（调用方可在更高层重试）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::UpstreamUnavailable(_) | AgentError::CheckpointUnavailable(_)
        )
    }
}
