//! 请求上下文
//!
//! 显式携带 user_id / session_id / role / 取消令牌 / 截止时间，逐层传递，
//! 替代任何隐式的线程局部上下文。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 单次请求的上下文，贯穿驱动器、中间件、网关与工具调用
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub session_id: String,
    /// 单一角色字符串；"admin" 解锁技能变更类工具
    pub user_role: String,
    /// 协作式取消：所有挂起点都应响应
    pub cancel: CancellationToken,
    /// 请求总预算的截止点
    pub deadline: Option<tokio::time::Instant>,
}

impl RequestContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            session_id: session_id.into(),
            user_role: "user".to_string(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.user_role = role.into();
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// 从现在起 budget 秒后超时
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.deadline = Some(tokio::time::Instant::now() + budget);
        self
    }

    /// 已取消或已超过截止点
    pub fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.deadline {
            Some(d) => tokio::time::Instant::now() >= d,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let ctx = RequestContext::new("s1").with_user("u1").with_role("admin");
        assert_eq!(ctx.session_id, "s1");
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert_eq!(ctx.user_role, "admin");
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_context_cancel() {
        let ctx = RequestContext::new("s1");
        ctx.cancel.cancel();
        assert!(ctx.is_cancelled());
    }
}
