//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持工具绑定与流式输出。

use std::pin::Pin;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionTool, ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionCall,
    FunctionObject,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::core::{Message, Role, ToolCall};
use crate::llm::{LlmClient, LlmError, LlmReply, ToolSpec};

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiBackend {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::SystemDirective => ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map(ChatCompletionRequestMessage::System)
                    .map_err(|e| LlmError::Schema(e.to_string())),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()
                    .map(ChatCompletionRequestMessage::User)
                    .map_err(|e| LlmError::Schema(e.to_string())),
                Role::Assistant => {
                    let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                    builder.content(m.content.clone());
                    if !m.tool_calls.is_empty() {
                        let calls: Vec<ChatCompletionMessageToolCall> = m
                            .tool_calls
                            .iter()
                            .map(|tc| ChatCompletionMessageToolCall {
                                id: tc.id.clone(),
                                r#type: ChatCompletionToolType::Function,
                                function: FunctionCall {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.to_string(),
                                },
                            })
                            .collect();
                        builder.tool_calls(calls);
                    }
                    builder
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant)
                        .map_err(|e| LlmError::Schema(e.to_string()))
                }
                Role::ToolResult => ChatCompletionRequestToolMessageArgs::default()
                    .content(m.content.clone())
                    .tool_call_id(m.tool_call_id.clone().unwrap_or_default())
                    .build()
                    .map(ChatCompletionRequestMessage::Tool)
                    .map_err(|e| LlmError::Schema(e.to_string())),
            })
            .collect()
    }

    fn to_openai_tools(&self, tools: &[ToolSpec]) -> Vec<ChatCompletionTool> {
        tools
            .iter()
            .map(|t| ChatCompletionTool {
                r#type: ChatCompletionToolType::Function,
                function: FunctionObject {
                    name: t.name.clone(),
                    description: Some(t.description.clone()),
                    parameters: Some(t.parameters.clone()),
                    strict: None,
                },
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        stream: bool,
    ) -> Result<async_openai::types::CreateChatCompletionRequest, LlmError> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?);
        if !tools.is_empty() {
            builder.tools(self.to_openai_tools(tools));
        }
        if stream {
            builder.stream(true);
        }
        builder.build().map_err(|e| LlmError::Schema(e.to_string()))
    }
}

/// 将 async_openai 错误映射到 LlmError 分类（429 -> RateLimited，5xx -> Upstream）
fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Upstream(e.to_string())
            }
        }
        OpenAIError::ApiError(api) => {
            let message = api.message.clone();
            let lower = message.to_lowercase();
            if lower.contains("rate limit") {
                LlmError::RateLimited
            } else if lower.contains("api key") || lower.contains("authentication") {
                LlmError::Auth(message)
            } else {
                LlmError::Upstream(message)
            }
        }
        OpenAIError::JSONDeserialize(e) => LlmError::Schema(e.to_string()),
        OpenAIError::InvalidArgument(e) => LlmError::Schema(e),
        other => LlmError::Upstream(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn infer(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<LlmReply, LlmError> {
        let request = self.build_request(messages, tools, false)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Schema("empty choices".to_string()))?;

        let text = choice.message.content.unwrap_or_default();
        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({})),
            })
            .collect();

        Ok(LlmReply { text, tool_calls })
    }

    async fn infer_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, LlmError>> + Send>>, LlmError>
    {
        let request = self.build_request(messages, tools, true)?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(map_openai_error)?;

        // 丢弃流即关闭底层连接；取消方只需 drop
        let tokens = stream.map(|item| match item {
            Ok(chunk) => Ok(chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default()),
            Err(e) => Err(map_openai_error(e)),
        });

        Ok(Box::pin(tokens))
    }
}
