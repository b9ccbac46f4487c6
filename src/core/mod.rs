//! 核心层：错误、请求上下文、消息/状态模型与服务入口

pub mod context;
pub mod error;
pub mod service;
pub mod state;

pub use context::RequestContext;
pub use error::AgentError;
pub use service::{ExecuteRequest, ExecutionMode, HiveService};
pub use state::{AgentState, Message, Role, StateMetadata, ToolCall};
