//! 历史压缩中间件
//!
//! 估算 token 超过阈值时，把除最近 K 条以外的消息替换为一条合成摘要消息；
//! 摘要本身走 LLM 网关，可配置独立的（更便宜的）模型。摘要失败不中断本轮。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{AgentError, AgentState, Message, RequestContext, Role};
use crate::llm::LlmGateway;
use crate::middleware::Middleware;

const SUMMARY_PROMPT: &str = "Summarize the following conversation in one compact paragraph: \
key facts, decisions, tool results and user preferences. Output only the summary.";

/// 粗粒度 token 估算：约 4 字符一个 token
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.content.chars().count() / 4 + 4).sum()
}

pub struct CompactionMiddleware {
    gateway: Arc<LlmGateway>,
    trigger_tokens: usize,
    keep_messages: usize,
    /// 摘要模型；None 时用网关默认模型
    model: Option<String>,
}

impl CompactionMiddleware {
    pub fn new(
        gateway: Arc<LlmGateway>,
        trigger_tokens: usize,
        keep_messages: usize,
        model: Option<String>,
    ) -> Self {
        Self {
            gateway,
            trigger_tokens,
            keep_messages: keep_messages.max(1),
            model,
        }
    }
}

#[async_trait]
impl Middleware for CompactionMiddleware {
    fn name(&self) -> &str {
        "compaction"
    }

    async fn before_model(
        &self,
        state: &mut AgentState,
        ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        if estimate_tokens(&state.messages) <= self.trigger_tokens {
            return Ok(());
        }

        // 头部指令不参与压缩
        let directive_offset = usize::from(
            state
                .messages
                .first()
                .map(|m| m.role == Role::SystemDirective)
                .unwrap_or(false),
        );
        let total = state.messages.len() - directive_offset;
        if total <= self.keep_messages {
            return Ok(());
        }

        let split = directive_offset + total - self.keep_messages;
        let to_summarize = state.messages[directive_offset..split].to_vec();

        let mut prompt_messages = vec![Message::directive(SUMMARY_PROMPT)];
        let transcript = to_summarize
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        prompt_messages.push(Message::user(transcript));

        let reply = match &self.model {
            Some(model) => {
                self.gateway
                    .call_with_model(model, &prompt_messages, &[], ctx)
                    .await
            }
            None => self.gateway.call(&prompt_messages, &[], ctx).await,
        };

        let summary = match reply {
            Ok(r) if !r.text.is_empty() => r.text,
            Ok(_) => return Ok(()),
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "history_compaction_failed");
                return Ok(());
            }
        };

        let summarized_count = to_summarize.len();
        let mut rebuilt = Vec::with_capacity(self.keep_messages + 2);
        rebuilt.extend(state.messages[..directive_offset].iter().cloned());
        rebuilt.push(Message::directive(format!(
            "Previous conversation summary ({} earlier messages):\n\n{}",
            summarized_count, summary
        )));
        rebuilt.extend(state.messages[split..].iter().cloned());

        tracing::info!(
            summarized = summarized_count,
            kept = self.keep_messages,
            "history_compacted"
        );
        state.messages = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSection;
    use crate::llm::{LlmReply, ScriptedLlm};

    fn long_state(n: usize) -> AgentState {
        let mut state = AgentState::default();
        for i in 0..n {
            state.append(Message::user(format!("message {} {}", i, "x".repeat(400))));
        }
        state
    }

    #[tokio::test]
    async fn test_compacts_above_threshold() {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmReply::text("the summary")]));
        let gateway = Arc::new(LlmGateway::single(llm, &LlmSection::default()));
        let mw = CompactionMiddleware::new(gateway, 1000, 5, None);

        let mut state = long_state(30);
        let ctx = RequestContext::new("s1");
        mw.before_model(&mut state, &ctx).await.unwrap();

        // 摘要 1 条 + 保留 5 条
        assert_eq!(state.messages.len(), 6);
        assert_eq!(state.messages[0].role, Role::SystemDirective);
        assert!(state.messages[0].content.contains("the summary"));
        assert!(state.messages[5].content.contains("message 29"));
    }

    #[tokio::test]
    async fn test_below_threshold_untouched() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let gateway = Arc::new(LlmGateway::single(llm, &LlmSection::default()));
        let mw = CompactionMiddleware::new(gateway, 100_000, 5, None);

        let mut state = long_state(10);
        let ctx = RequestContext::new("s1");
        mw.before_model(&mut state, &ctx).await.unwrap();
        assert_eq!(state.messages.len(), 10);
    }

    #[tokio::test]
    async fn test_directive_preserved_at_head() {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmReply::text("sum")]));
        let gateway = Arc::new(LlmGateway::single(llm, &LlmSection::default()));
        let mw = CompactionMiddleware::new(gateway, 1000, 3, None);

        let mut state = AgentState::default();
        state.append(Message::directive("the system directive"));
        for i in 0..20 {
            state.append(Message::user(format!("m{} {}", i, "y".repeat(400))));
        }
        let ctx = RequestContext::new("s1");
        mw.before_model(&mut state, &ctx).await.unwrap();

        assert_eq!(state.messages[0].content, "the system directive");
        assert!(state.messages[1].content.contains("sum"));
        assert_eq!(state.messages.len(), 5);
    }

    #[test]
    fn test_token_estimate_monotone() {
        let short = vec![Message::user("hi")];
        let long = vec![Message::user("hello world, this is much longer")];
        assert!(estimate_tokens(&long) > estimate_tokens(&short));
    }
}
