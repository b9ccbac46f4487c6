//! 可观测性中间件
//!
//! ObservabilityMiddleware 围绕模型与工具调用发结构化事件，不改变语义；
//! MetricsMiddleware 把每次模型调用的墙钟耗时记入按模型名标注的直方图。

use async_trait::async_trait;

use crate::core::{AgentError, AgentState, RequestContext};
use crate::middleware::{
    Middleware, ModelFuture, ModelHandler, ModelRequest, ToolDispatch, ToolFuture, ToolHandler,
    ToolCallRequest,
};
use crate::observability::Metrics;

/// 结构化事件探针
pub struct ObservabilityMiddleware;

#[async_trait]
impl Middleware for ObservabilityMiddleware {
    fn name(&self) -> &str {
        "observe"
    }

    async fn before_model(
        &self,
        state: &mut AgentState,
        ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        tracing::debug!(
            session_id = %ctx.session_id,
            user_id = ctx.user_id.as_deref().unwrap_or(""),
            message_count = state.messages.len(),
            "model_call_preparing"
        );
        Ok(())
    }

    fn wrap_model_call<'a>(
        &'a self,
        req: ModelRequest,
        ctx: &'a RequestContext,
        next: ModelHandler<'a>,
    ) -> ModelFuture<'a> {
        Box::pin(async move {
            tracing::info!(
                session_id = %ctx.session_id,
                model = %req.model,
                tool_count = req.tools.len(),
                "model_call_started"
            );
            let result = next.run(req).await;
            match &result {
                Ok(reply) => tracing::info!(
                    session_id = %ctx.session_id,
                    tool_calls = reply.tool_calls.len(),
                    "model_call_completed"
                ),
                Err(e) => tracing::warn!(session_id = %ctx.session_id, error = %e, "model_call_failed"),
            }
            result
        })
    }

    fn wrap_tool_call<'a>(
        &'a self,
        req: ToolCallRequest,
        ctx: &'a RequestContext,
        next: ToolHandler<'a>,
    ) -> ToolFuture<'a> {
        Box::pin(async move {
            let tool_name = req.call.name.clone();
            tracing::info!(session_id = %ctx.session_id, tool = %tool_name, "tool_call_executing");
            let result = next.run(req).await;
            match &result {
                Ok(ToolDispatch::Result(_)) => {
                    tracing::info!(session_id = %ctx.session_id, tool = %tool_name, "tool_call_completed")
                }
                Ok(ToolDispatch::Goto(target)) => {
                    tracing::info!(session_id = %ctx.session_id, tool = %tool_name, goto = %target, "tool_call_routed")
                }
                Err(e) => {
                    tracing::warn!(session_id = %ctx.session_id, tool = %tool_name, error = %e, "tool_call_failed")
                }
            }
            result
        })
    }
}

/// 模型调用耗时直方图探针
pub struct MetricsMiddleware;

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn wrap_model_call<'a>(
        &'a self,
        req: ModelRequest,
        _ctx: &'a RequestContext,
        next: ModelHandler<'a>,
    ) -> ModelFuture<'a> {
        Box::pin(async move {
            let model = req.model.clone();
            let start = std::time::Instant::now();
            let result = next.run(req).await;
            Metrics::global().llm.observe_latency(&model, start.elapsed());
            result
        })
    }
}
