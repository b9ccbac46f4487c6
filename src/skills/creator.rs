//! 技能生成器
//!
//! 用 LLM 将指令或对话模式提炼为结构化技能（JSON: name / description / tags / content）；
//! 解析失败不报错，返回 None 由调用方提示重试。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::{Message, RequestContext};
use crate::llm::LlmGateway;
use crate::skills::{Skill, SkillSource};

const CREATE_PROMPT: &str = "You are a Skill Creator. Distill the user's instruction into a reusable skill.\n\
Respond with ONLY a JSON object:\n\
{\"name\": \"snake_case_name\", \"description\": \"one sentence\", \"tags\": [\"tag1\"], \"content\": \"markdown body with procedures and examples\"}";

const UPDATE_PROMPT: &str = "You are a Skill Maintainer. Merge the new information into the existing skill, preserving prior knowledge.\n\
Respond with ONLY a JSON object:\n\
{\"name\": \"same_name\", \"description\": \"updated one sentence\", \"tags\": [\"tag1\"], \"content\": \"merged markdown body\"}";

#[derive(Debug, Deserialize)]
struct SkillDraft {
    name: String,
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    content: String,
}

/// LLM 技能生成器
pub struct SkillCreator {
    gateway: Arc<LlmGateway>,
}

impl SkillCreator {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    /// 从指令创建技能；LLM 输出无法解析时返回 None
    pub async fn create_from_instruction(
        &self,
        instruction: &str,
        source: SkillSource,
    ) -> Option<Skill> {
        let messages = vec![
            Message::directive(CREATE_PROMPT),
            Message::user(instruction.to_string()),
        ];
        let draft = self.ask(&messages).await?;

        tracing::info!(skill_name = %draft.name, "skill_draft_created");
        Some(
            Skill::new(draft.name, draft.description, draft.content, source)
                .with_tags(draft.tags)
                .auto(),
        )
    }

    /// 将新知识并入既有技能；版本推进由注册表处理
    pub async fn update_skill(&self, existing: &Skill, new_info: &str) -> Option<Skill> {
        let prompt = format!(
            "## Existing skill: {}\n{}\n\n{}\n\n## New information\n{}",
            existing.name, existing.description, existing.content, new_info
        );
        let messages = vec![Message::directive(UPDATE_PROMPT), Message::user(prompt)];
        let draft = self.ask(&messages).await?;

        let mut updated = existing.clone();
        updated.description = draft.description;
        updated.content = draft.content;
        if !draft.tags.is_empty() {
            updated.tags = draft.tags;
        }
        updated.auto_generated = true;
        Some(updated)
    }

    async fn ask(&self, messages: &[Message]) -> Option<SkillDraft> {
        let ctx = RequestContext::new("skill-creator");
        let reply = match self.gateway.call(messages, &[], &ctx).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "skill_creation_llm_failed");
                return None;
            }
        };

        let json = extract_json_block(&reply.text)?;
        match serde_json::from_str::<SkillDraft>(json) {
            Ok(draft) if !draft.name.is_empty() && !draft.content.is_empty() => Some(draft),
            Ok(_) => {
                tracing::warn!("skill_draft_missing_fields");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "skill_draft_parse_failed");
                None
            }
        }
    }
}

/// 从 LLM 输出中提取 JSON（```json 围栏或首个 {...} 块）
fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        Some(&trimmed[start..=end])
    } else {
        None
    }
}
