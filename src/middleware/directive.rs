//! 系统指令中间件（始终启用）
//!
//! 每次 before_model 用显式 PromptContext 渲染指令：模板 + 技能索引（仅名称与描述）+
//! 调用方提供的记忆上下文。渲染是纯函数 build_directive(context)。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{AgentError, AgentState, Message, RequestContext, Role};
use crate::middleware::Middleware;
use crate::skills::SkillRegistry;

/// 默认系统模板
pub const DEFAULT_TEMPLATE: &str = "You are a helpful AI assistant. Answer accurately and concisely. \
Use the available tools when they help you fulfil the request.";

/// 指令渲染的全部输入
#[derive(Clone, Debug)]
pub struct PromptContext {
    pub template: String,
    pub skills_index: String,
    pub memory_context: String,
    pub user_role: String,
    pub now: DateTime<Utc>,
}

/// 纯函数：PromptContext -> 指令文本
pub fn build_directive(ctx: &PromptContext) -> String {
    let mut sections = vec![ctx.template.clone()];

    if !ctx.skills_index.is_empty() {
        sections.push(ctx.skills_index.clone());
    }
    if !ctx.memory_context.is_empty() {
        sections.push(format!(
            "## Relevant memory from previous conversations\n{}",
            ctx.memory_context
        ));
    }
    sections.push(format!(
        "Current time: {} | User role: {}",
        ctx.now.format("%Y-%m-%d %H:%M UTC"),
        ctx.user_role
    ));

    sections.join("\n\n")
}

/// 指令中间件：维护消息列表头部唯一的 system_directive
pub struct DirectiveMiddleware {
    template: String,
    skills: Arc<SkillRegistry>,
}

impl DirectiveMiddleware {
    pub fn new(skills: Arc<SkillRegistry>) -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            skills,
        }
    }

    /// 覆盖模板（工作者有自己的系统指令）
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }
}

#[async_trait]
impl Middleware for DirectiveMiddleware {
    fn name(&self) -> &str {
        "directive"
    }

    async fn before_model(
        &self,
        state: &mut AgentState,
        ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        let prompt_ctx = PromptContext {
            template: self.template.clone(),
            skills_index: self.skills.skills_prompt().await,
            memory_context: state.metadata.memory_context.clone(),
            user_role: ctx.user_role.clone(),
            now: Utc::now(),
        };
        let directive = build_directive(&prompt_ctx);

        // 头部已有指令则换新，否则插入
        if state
            .messages
            .first()
            .map(|m| m.role == Role::SystemDirective)
            .unwrap_or(false)
        {
            state.messages[0] = Message::directive(directive);
        } else {
            state.messages.insert(0, Message::directive(directive));
        }
        Ok(())
    }
}
