//! 运行过程事件：驱动器/调度器 -> 消费方的 Token/事件序列
//!
//! 错误以独立事件种类先于终止 Done 发出，消费方可在不丢失已有输出的情况下渲染提示。

use serde::Serialize;
use tokio::sync::mpsc;

/// 单步过程事件（序列化为 JSON 供外层传输）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 新一轮 Agent 循环
    CycleStarted { cycle: usize, cap: usize },
    /// assistant 回复（含工具调用数）
    AssistantMessage { content: String, tool_calls: usize },
    /// 工具调用开始
    ToolCallStarted {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具结果（预览，避免过长）
    ToolResult { tool: String, preview: String },
    /// 多智能体路由：控制权交给指定工作者
    Handoff { worker: String },
    /// 工作流：一轮扇出开始
    RoundStarted { round: usize, steps: Vec<String> },
    /// 工作流：单步完成
    StepCompleted { step_id: String, worker: String },
    /// 最终回复的一小段（流式输出）
    MessageChunk { text: String },
    /// 错误（先于 Done 发出）
    Error { text: String },
    /// 流结束
    Done,
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

/// 事件通道
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// 发送事件；接收端已关闭时静默丢弃
pub fn send_event(tx: &Option<&EventSender>, event: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(event);
    }
}

/// 工具结果预览最大字符数
pub const PREVIEW_CHARS: usize = 200;

/// 截断预览
pub fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 流式回复时每段字符数
pub const CHUNK_CHARS: usize = 6;

/// 把最终文本按块发送，并以 Done 收尾
pub fn emit_chunks_and_done(tx: &Option<&EventSender>, text: &str) {
    if let Some(t) = tx {
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(CHUNK_CHARS) {
            let _ = t.send(AgentEvent::MessageChunk {
                text: chunk.iter().collect(),
            });
        }
        let _ = t.send(AgentEvent::Done);
    }
}
