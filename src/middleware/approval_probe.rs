//! 审批中间件（审批门的 wrap_tool_call 实现）
//!
//! 工具名命中敏感模式（子串匹配）时：创建审批请求，合成一条
//! "Approval required, id=..." 的 tool_result 直接返回，不调用 next，底层工具不执行。
//! 默认策略不自动续跑：审批通过后由下游重新提交请求（见 DESIGN.md）。

use std::sync::Arc;

use async_trait::async_trait;

use crate::approval::ApprovalGate;
use crate::core::RequestContext;
use crate::middleware::{Middleware, ToolCallRequest, ToolDispatch, ToolFuture, ToolHandler};
use crate::observability::Metrics;

pub struct ApprovalMiddleware {
    gate: Arc<ApprovalGate>,
    /// 敏感工具名模式（小写子串）
    patterns: Vec<String>,
}

impl ApprovalMiddleware {
    pub fn new(gate: Arc<ApprovalGate>, patterns: Vec<String>) -> Self {
        Self {
            gate,
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// 敏感性判定是确定的：只看名称与模式集合
    pub fn is_sensitive(&self, tool_name: &str) -> bool {
        let lower = tool_name.to_lowercase();
        self.patterns.iter().any(|p| lower.contains(p))
    }
}

#[async_trait]
impl Middleware for ApprovalMiddleware {
    fn name(&self) -> &str {
        "approval"
    }

    fn wrap_tool_call<'a>(
        &'a self,
        req: ToolCallRequest,
        _ctx: &'a RequestContext,
        next: ToolHandler<'a>,
    ) -> ToolFuture<'a> {
        if !self.is_sensitive(&req.call.name) {
            return next.run(req);
        }

        Box::pin(async move {
            Metrics::global().tools.record_interception();
            tracing::info!(
                tool = %req.call.name,
                session_id = %req.session_id,
                "tool_call_intercepted"
            );

            let record = self
                .gate
                .create(
                    &req.session_id,
                    req.user_id.as_deref(),
                    "tool_execution",
                    &format!("Execute tool `{}`", req.call.name),
                    serde_json::json!({
                        "name": req.call.name,
                        "arguments": req.call.arguments,
                        "tool_call_id": req.call.id,
                    }),
                    None,
                )
                .await;

            Ok(ToolDispatch::Result(format!(
                "Approval required, id={}. Action `{}` is sensitive and was not executed; \
                 a reviewer must approve it via the approval API, then the request can be re-submitted.",
                record.id, req.call.name
            )))
        })
    }
}
