//! LLM 客户端抽象
//!
//! 所有后端实现 LlmClient：infer（非流式，返回文本 + 工具调用）、infer_stream（流式 Token）。
//! 流是惰性、有限、不可重启的；消费方要么读完要么显式取消。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::core::{Message, ToolCall};

/// LLM 调用错误；is_retriable 决定网关是否重试 / 轮转模型环
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Request timeout")]
    Timeout,

    #[error("Rate limited")]
    RateLimited,

    /// 上游瞬态错误（5xx、连接中断等）
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// 请求构造 / 响应 Schema 错误
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Cancelled")]
    Cancelled,
}

impl LlmError {
    /// 超时 / 限流 / 上游瞬态错误可重试；鉴权与 Schema 错误不可
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::RateLimited | LlmError::Upstream(_)
        )
    }
}

/// 绑定给模型的工具描述（名称、说明、JSON Schema 参数）
#[derive(Clone, Debug, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// 单次推理结果：assistant 文本与零或多个工具调用
#[derive(Clone, Debug, Default)]
pub struct LlmReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Token 流：惰性、有限、不可重启
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 后端的模型名（指标标签与模型环定位用）
    fn model_name(&self) -> &str;

    /// 非流式推理
    async fn infer(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<LlmReply, LlmError>;

    /// 流式推理，返回 Token 流
    async fn infer_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<TokenStream, LlmError>;
}
