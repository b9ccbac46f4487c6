//! 技能类内置工具
//!
//! load_skill 按需把技能正文拉入上下文；create_skill / update_skill 为敏感类且仅 admin 可见；
//! list_skills 列出全部技能明细。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::skills::{SkillCreator, SkillRegistry, SkillSource};
use crate::tools::Tool;

fn string_arg(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required argument: {}", key))
}

/// load_skill(name) -> 技能完整正文
pub struct LoadSkillTool {
    registry: Arc<SkillRegistry>,
}

impl LoadSkillTool {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for LoadSkillTool {
    fn name(&self) -> &str {
        "load_skill"
    }

    fn description(&self) -> &str {
        "Load the full content of a named skill into context when its detailed instructions are needed"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "The skill name to load"}
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let name = string_arg(&args, "name")?;
        match self.registry.get(&name).await {
            Some(skill) => {
                tracing::info!(skill_name = %name, "skill_loaded_by_agent");
                Ok(format!("# Skill: {}\n\n{}", skill.name, skill.content))
            }
            None => {
                let available: Vec<String> =
                    self.registry.list().await.into_iter().map(|s| s.name).collect();
                Ok(format!(
                    "Skill '{}' not found. Available skills: {}",
                    name,
                    available.join(", ")
                ))
            }
        }
    }
}

/// create_skill(instruction)：LLM 生成并持久化新技能
pub struct CreateSkillTool {
    registry: Arc<SkillRegistry>,
    creator: Arc<SkillCreator>,
}

impl CreateSkillTool {
    pub fn new(registry: Arc<SkillRegistry>, creator: Arc<SkillCreator>) -> Self {
        Self { registry, creator }
    }
}

#[async_trait]
impl Tool for CreateSkillTool {
    fn name(&self) -> &str {
        "create_skill"
    }

    fn description(&self) -> &str {
        "Create a new reusable skill from instructions or a conversation pattern worth preserving"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "instruction": {
                    "type": "string",
                    "description": "What the skill should capture: procedures, examples, domain knowledge"
                }
            },
            "required": ["instruction"]
        })
    }

    fn is_sensitive(&self) -> bool {
        true
    }

    fn required_role(&self) -> Option<&str> {
        Some("admin")
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let instruction = string_arg(&args, "instruction")?;
        let skill = self
            .creator
            .create_from_instruction(&instruction, SkillSource::Agent)
            .await
            .ok_or_else(|| {
                "Failed to create skill from the given instruction. Please provide more specific details."
                    .to_string()
            })?;

        let registered = self.registry.register_or_update(skill).await;
        Ok(format!(
            "Skill '{}' created successfully (v{}).\nDescription: {}\nThe skill is now available via load_skill.",
            registered.name, registered.version, registered.description
        ))
    }
}

/// update_skill(name, new_info)：把新知识并入既有技能
pub struct UpdateSkillTool {
    registry: Arc<SkillRegistry>,
    creator: Arc<SkillCreator>,
}

impl UpdateSkillTool {
    pub fn new(registry: Arc<SkillRegistry>, creator: Arc<SkillCreator>) -> Self {
        Self { registry, creator }
    }
}

#[async_trait]
impl Tool for UpdateSkillTool {
    fn name(&self) -> &str {
        "update_skill"
    }

    fn description(&self) -> &str {
        "Incrementally merge new knowledge, corrections or patterns into an existing skill"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Name of the existing skill"},
                "new_info": {"type": "string", "description": "New information to merge in"}
            },
            "required": ["name", "new_info"]
        })
    }

    fn is_sensitive(&self) -> bool {
        true
    }

    fn required_role(&self) -> Option<&str> {
        Some("admin")
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let name = string_arg(&args, "name")?;
        let new_info = string_arg(&args, "new_info")?;

        let existing = match self.registry.get(&name).await {
            Some(s) => s,
            None => {
                let available: Vec<String> =
                    self.registry.list().await.into_iter().map(|s| s.name).collect();
                return Ok(format!(
                    "Skill '{}' not found. Available skills: {}",
                    name,
                    available.join(", ")
                ));
            }
        };

        let updated = self
            .creator
            .update_skill(&existing, &new_info)
            .await
            .ok_or_else(|| format!("Failed to update skill '{}'.", name))?;

        let registered = self.registry.register_or_update(updated).await;
        Ok(format!(
            "Skill '{}' updated to v{}.\nDescription: {}",
            registered.name, registered.version, registered.description
        ))
    }
}

/// list_skills()：全部技能明细
pub struct ListSkillsTool {
    registry: Arc<SkillRegistry>,
}

impl ListSkillsTool {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ListSkillsTool {
    fn name(&self) -> &str {
        "list_skills"
    }

    fn description(&self) -> &str {
        "List all registered skills with version, source and tags"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        let skills = self.registry.list().await;
        if skills.is_empty() {
            return Ok("No skills registered.".to_string());
        }

        let mut lines = vec![format!("Total skills: {}", skills.len()), String::new()];
        for s in skills {
            let auto_str = if s.auto_generated { " [auto-generated]" } else { " [manual]" };
            let tag_str = if s.tags.is_empty() {
                String::new()
            } else {
                format!(" Tags: {}", s.tags.join(", "))
            };
            lines.push(format!(
                "- **{}** (v{}){}: {}{}",
                s.name, s.version, auto_str, s.description, tag_str
            ));
        }
        Ok(lines.join("\n"))
    }
}
