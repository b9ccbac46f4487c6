//! 技能层：Markdown 技能注册表与 LLM 技能生成器

pub mod creator;
pub mod registry;

pub use creator::SkillCreator;
pub use registry::{
    parse_skill_markdown, render_skill_markdown, Skill, SkillRegistry, SkillSource,
};
