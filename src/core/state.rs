//! 会话状态模型
//!
//! Message 为带稳定 id 的标签变体（user / assistant / tool_result / system_directive），
//! 会话内全序、只追加；AgentState 的唯一变更方式是 append。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// 工具调用结果，通过 tool_call_id 指回 assistant 消息中的调用
    ToolResult,
    /// 系统指令（由指令中间件注入或替换）
    SystemDirective,
}

/// 模型产出的工具调用请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// 自由形式键值参数
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// 单条消息；id 稳定且不可变
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// 仅 assistant 消息可携带
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// 仅 tool_result 消息携带，指向被响应的调用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    /// 带工具调用的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut m = Self::base(Role::Assistant, content);
        m.tool_calls = calls;
        m
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::base(Role::ToolResult, content);
        m.tool_call_id = Some(call_id.into());
        m
    }

    pub fn directive(content: impl Into<String>) -> Self {
        Self::base(Role::SystemDirective, content)
    }
}

/// 会话状态元数据（user_id / session_id / user_role 等）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateMetadata {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub user_role: String,
    /// 调用方附加的记忆上下文，指令中间件会注入到系统指令中
    #[serde(default)]
    pub memory_context: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// 每线程的 Agent 状态；单调，唯一变更是 append
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<Message>,
    pub metadata: StateMetadata,
}

impl AgentState {
    pub fn new(metadata: StateMetadata) -> Self {
        Self {
            messages: Vec::new(),
            metadata,
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    /// 最后一条 assistant 消息
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// 最后一条 user 消息的内容
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// 指定调用 id 的工具结果是否已写回
    pub fn has_tool_result(&self, call_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == Role::ToolResult && m.tool_call_id.as_deref() == Some(call_id))
    }
}
