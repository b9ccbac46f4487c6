//! 脚本化 Mock LLM 客户端（用于测试，无需 API）
//!
//! 预先排队若干 LlmReply，每次 infer 取出一条；队列空时回显最后一条 User 消息。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::core::{Message, Role};
use crate::llm::{LlmClient, LlmError, LlmReply, ToolSpec};

/// 脚本化客户端：按序返回预置回复
pub struct ScriptedLlm {
    model: String,
    replies: Mutex<VecDeque<LlmReply>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<LlmReply>) -> Self {
        Self {
            model: "scripted".to_string(),
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// 已发生的 infer 次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self, messages: &[Message]) -> LlmReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        LlmReply::text(format!("Echo: {}", last_user))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn infer(&self, messages: &[Message], _tools: &[ToolSpec]) -> Result<LlmReply, LlmError> {
        Ok(self.next_reply(messages))
    }

    async fn infer_stream(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, LlmError>> + Send>>, LlmError>
    {
        let reply = self.next_reply(messages);
        // 按 6 字符一段切分，模拟 Token 流
        let chunks: Vec<Result<String, LlmError>> = reply
            .text
            .chars()
            .collect::<Vec<_>>()
            .chunks(6)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolCall;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let llm = ScriptedLlm::new(vec![
            LlmReply::text("first"),
            LlmReply::text("").with_tool_calls(vec![ToolCall::new(
                "web_search",
                serde_json::json!({"q": "X"}),
            )]),
        ]);

        let reply = llm.infer(&[Message::user("hi")], &[]).await.unwrap();
        assert_eq!(reply.text, "first");

        let reply = llm.infer(&[Message::user("hi")], &[]).await.unwrap();
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "web_search");

        // 队列耗尽后回显
        let reply = llm.infer(&[Message::user("tail")], &[]).await.unwrap();
        assert_eq!(reply.text, "Echo: tail");
        assert_eq!(llm.call_count(), 3);
    }
}
