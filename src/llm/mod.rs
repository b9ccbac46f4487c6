//! LLM 层：网关（模型环 + 重试回退）与后端实现（OpenAI 兼容 / Scripted Mock）

pub mod gateway;
pub mod mock;
pub mod openai;
pub mod traits;

pub use gateway::LlmGateway;
pub use mock::ScriptedLlm;
pub use openai::OpenAiBackend;
pub use traits::{LlmClient, LlmError, LlmReply, TokenStream, ToolSpec};
