//! 中间件层
//!
//! 中间件是实现四个可选钩子的值：before_model / after_model 直接改 AgentState，
//! wrap_model_call / wrap_tool_call 形成洋葱（下标 0 最外层）。驱动器每循环按序执行：
//! 全部 before_model -> 经 wrap_model_call 链到达模型终端 -> 全部 after_model ->
//! 对每个工具调用走 wrap_tool_call 链。wrap_* 返回装箱 Future，实现可同步计算也可 await。

pub mod approval_probe;
pub mod compaction;
pub mod directive;
pub mod observe;
pub mod role_filter;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{AgentError, AgentState, Message, RequestContext, ToolCall};
use crate::llm::{LlmReply, ToolSpec};

pub use approval_probe::ApprovalMiddleware;
pub use compaction::CompactionMiddleware;
pub use directive::{build_directive, DirectiveMiddleware, PromptContext};
pub use observe::{MetricsMiddleware, ObservabilityMiddleware};
pub use role_filter::RoleFilterMiddleware;

/// 一次模型调用的请求（中间件可改写 messages / tools）
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    /// 请求的模型名（指标标签）
    pub model: String,
}

/// 一次工具调用的请求
#[derive(Clone, Debug)]
pub struct ToolCallRequest {
    pub call: ToolCall,
    pub session_id: String,
    pub user_id: Option<String>,
    pub user_role: String,
}

/// 工具链的和类型结果：普通结果落为 tool_result 消息；Goto 由路由器接管
#[derive(Clone, Debug, PartialEq)]
pub enum ToolDispatch {
    Result(String),
    /// 跳转目标节点（多智能体 handoff）
    Goto(String),
}

pub type ModelFuture<'a> =
    Pin<Box<dyn Future<Output = Result<LlmReply, AgentError>> + Send + 'a>>;
pub type ToolFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ToolDispatch, AgentError>> + Send + 'a>>;

/// 模型链的最内层（通常是 LLM 网关）
#[async_trait]
pub trait ModelTerminal: Send + Sync {
    async fn call(&self, req: ModelRequest) -> Result<LlmReply, AgentError>;
}

/// 工具链的最内层（注册表执行或 handoff 判定）
#[async_trait]
pub trait ToolTerminal: Send + Sync {
    async fn call(&self, req: ToolCallRequest) -> Result<ToolDispatch, AgentError>;
}

/// 模型链游标：run 消耗自身，把请求交给剩余链或终端
pub struct ModelHandler<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn ModelTerminal,
    ctx: &'a RequestContext,
}

impl<'a> ModelHandler<'a> {
    pub fn run(self, req: ModelRequest) -> ModelFuture<'a> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                let next = ModelHandler {
                    chain: rest,
                    terminal: self.terminal,
                    ctx: self.ctx,
                };
                mw.wrap_model_call(req, self.ctx, next)
            }
            None => self.terminal.call(req),
        }
    }
}

/// 工具链游标
pub struct ToolHandler<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn ToolTerminal,
    ctx: &'a RequestContext,
}

impl<'a> ToolHandler<'a> {
    pub fn run(self, req: ToolCallRequest) -> ToolFuture<'a> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                let next = ToolHandler {
                    chain: rest,
                    terminal: self.terminal,
                    ctx: self.ctx,
                };
                mw.wrap_tool_call(req, self.ctx, next)
            }
            None => self.terminal.call(req),
        }
    }
}

/// 中间件：四个钩子全部可选（默认直通）
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// 模型调用前的状态增量（如注入系统指令、压缩历史）
    async fn before_model(
        &self,
        _state: &mut AgentState,
        _ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    /// 模型调用后的状态增量
    async fn after_model(
        &self,
        _state: &mut AgentState,
        _ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    /// 包装模型调用；默认透传
    fn wrap_model_call<'a>(
        &'a self,
        req: ModelRequest,
        _ctx: &'a RequestContext,
        next: ModelHandler<'a>,
    ) -> ModelFuture<'a> {
        next.run(req)
    }

    /// 包装工具调用；默认透传。不得静默吞错。
    fn wrap_tool_call<'a>(
        &'a self,
        req: ToolCallRequest,
        _ctx: &'a RequestContext,
        next: ToolHandler<'a>,
    ) -> ToolFuture<'a> {
        next.run(req)
    }
}

/// 有序中间件集合；在驱动器构造时显式传入
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    items: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.items.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.items.push(middleware);
    }

    /// 追加另一组中间件（保持其相对顺序）
    pub fn extend(&mut self, other: &MiddlewareStack) {
        self.items.extend(other.items.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 按序执行全部 before_model
    pub async fn before_model(
        &self,
        state: &mut AgentState,
        ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        for mw in &self.items {
            mw.before_model(state, ctx).await?;
        }
        Ok(())
    }

    /// 按序执行全部 after_model
    pub async fn after_model(
        &self,
        state: &mut AgentState,
        ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        for mw in &self.items {
            mw.after_model(state, ctx).await?;
        }
        Ok(())
    }

    /// 洋葱式模型调用
    pub async fn model_call(
        &self,
        req: ModelRequest,
        ctx: &RequestContext,
        terminal: &dyn ModelTerminal,
    ) -> Result<LlmReply, AgentError> {
        ModelHandler {
            chain: &self.items,
            terminal,
            ctx,
        }
        .run(req)
        .await
    }

    /// 洋葱式工具调用
    pub async fn tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &RequestContext,
        terminal: &dyn ToolTerminal,
    ) -> Result<ToolDispatch, AgentError> {
        ToolHandler {
            chain: &self.items,
            terminal,
            ctx,
        }
        .run(req)
        .await
    }
}
