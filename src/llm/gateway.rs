//! LLM 网关：模型环 + 重试回退
//!
//! 调用从默认后端开始；瞬态错误按指数退避重试（约 1s/2s/4s），单后端重试耗尽后
//! 轮转到环中下一个后端。调用预算上限为 后端数 × 重试次数。
//! 每个后端持有独立 Semaphore 限制并发，避免触发供应商限流。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::config::LlmSection;
use crate::core::{AgentError, Message, RequestContext};
use crate::llm::{LlmClient, LlmError, LlmReply, TokenStream, ToolSpec};
use crate::observability::Metrics;

/// 模型环中的单个后端
struct GatewayBackend {
    client: Arc<dyn LlmClient>,
    limiter: Arc<Semaphore>,
}

/// 统一调用面：call（非流式）与 stream（流式）
pub struct LlmGateway {
    backends: Vec<GatewayBackend>,
    /// 默认起点在环中的下标
    default_index: usize,
    retry_attempts: u32,
    backoff_base: Duration,
    call_timeout: Duration,
}

impl LlmGateway {
    /// 按配置的 model_ring 顺序组装；default_model 必须在环中，否则取第 0 个
    pub fn new(clients: Vec<Arc<dyn LlmClient>>, cfg: &LlmSection) -> Self {
        let default_index = clients
            .iter()
            .position(|c| c.model_name() == cfg.default_model)
            .unwrap_or(0);
        let backends = clients
            .into_iter()
            .map(|client| GatewayBackend {
                client,
                limiter: Arc::new(Semaphore::new(cfg.per_backend_concurrency.max(1))),
            })
            .collect();
        Self {
            backends,
            default_index,
            retry_attempts: cfg.retry_attempts.max(1),
            backoff_base: Duration::from_secs_f64(cfg.retry_backoff_base_seconds.max(0.0)),
            call_timeout: Duration::from_secs(cfg.per_backend_timeout_seconds),
        }
    }

    /// 单后端便捷构造（测试与工作者栈使用）
    pub fn single(client: Arc<dyn LlmClient>, cfg: &LlmSection) -> Self {
        Self::new(vec![client], cfg)
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// 每次请求的最大后端调用数
    pub fn call_budget(&self) -> u32 {
        self.backends.len() as u32 * self.retry_attempts
    }

    fn ring_from(&self, start: usize) -> impl Iterator<Item = &GatewayBackend> {
        let n = self.backends.len();
        (0..n).map(move |i| &self.backends[(start + i) % n])
    }

    fn index_of(&self, model: &str) -> usize {
        self.backends
            .iter()
            .position(|b| b.client.model_name() == model)
            .unwrap_or(self.default_index)
    }

    /// 非流式调用；从默认模型起沿环重试
    pub async fn call(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        ctx: &RequestContext,
    ) -> Result<LlmReply, AgentError> {
        self.call_from(self.default_index, messages, tools, ctx).await
    }

    /// 指定模型起点（压缩中间件用单独的 summarization 模型）
    pub async fn call_with_model(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        ctx: &RequestContext,
    ) -> Result<LlmReply, AgentError> {
        self.call_from(self.index_of(model), messages, tools, ctx).await
    }

    async fn call_from(
        &self,
        start: usize,
        messages: &[Message],
        tools: &[ToolSpec],
        ctx: &RequestContext,
    ) -> Result<LlmReply, AgentError> {
        let metrics = Metrics::global();
        let mut last_error = String::new();

        for (rotation, backend) in self.ring_from(start).enumerate() {
            let model = backend.client.model_name().to_string();
            if rotation > 0 {
                metrics.llm.record_rotation();
                tracing::warn!(model = %model, "llm_ring_rotated");
            }

            for attempt in 0..self.retry_attempts {
                if ctx.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }

                let _permit = backend
                    .limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| AgentError::UpstreamUnavailable("limiter closed".into()))?;

                let start_at = std::time::Instant::now();
                let outcome = tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                    r = timeout(self.call_timeout, backend.client.infer(messages, tools)) => {
                        match r {
                            Ok(inner) => inner,
                            Err(_) => Err(LlmError::Timeout),
                        }
                    }
                };
                let elapsed = start_at.elapsed();

                match outcome {
                    Ok(reply) => {
                        metrics.llm.record_call(true);
                        tracing::debug!(
                            model = %model,
                            attempt,
                            elapsed_ms = elapsed.as_millis() as u64,
                            tool_calls = reply.tool_calls.len(),
                            "llm_call_completed"
                        );
                        return Ok(reply);
                    }
                    Err(e) if e.is_retriable() => {
                        metrics.llm.record_call(false);
                        metrics.llm.record_retry();
                        last_error = format!("{}: {}", model, e);
                        tracing::warn!(model = %model, attempt, error = %e, "llm_call_retrying");
                        if attempt + 1 < self.retry_attempts {
                            let wait = self.backoff_base * 2u32.pow(attempt);
                            tokio::select! {
                                _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                                _ = tokio::time::sleep(wait) => {}
                            }
                        }
                    }
                    Err(LlmError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(LlmError::Auth(m)) => {
                        metrics.llm.record_call(false);
                        return Err(AgentError::AuthFailed(m));
                    }
                    Err(LlmError::Schema(m)) => {
                        metrics.llm.record_call(false);
                        return Err(AgentError::SchemaViolation(m));
                    }
                    Err(e) => {
                        metrics.llm.record_call(false);
                        last_error = format!("{}: {}", model, e);
                    }
                }
            }
        }

        tracing::error!(error = %last_error, "llm_ring_exhausted");
        Err(AgentError::UpstreamUnavailable(last_error))
    }

    /// 流式调用：只在默认后端上打开一次流，不做环内重试（流不可重启）
    pub async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        ctx: &RequestContext,
    ) -> Result<TokenStream, AgentError> {
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let backend = &self.backends[self.default_index];
        let _permit = backend
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::UpstreamUnavailable("limiter closed".into()))?;

        backend
            .client
            .infer_stream(messages, tools)
            .await
            .map_err(|e| match e {
                LlmError::Auth(m) => AgentError::AuthFailed(m),
                LlmError::Schema(m) => AgentError::SchemaViolation(m),
                LlmError::Cancelled => AgentError::Cancelled,
                other => AgentError::UpstreamUnavailable(other.to_string()),
            })
    }

    /// 默认模型名
    pub fn default_model(&self) -> &str {
        self.backends[self.default_index].client.model_name()
    }
}
