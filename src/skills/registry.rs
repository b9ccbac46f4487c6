//! 技能注册表
//!
//! 技能来自 Markdown 文件（frontmatter: name / description / tags / version / source /
//! auto_generated），从技能目录与其 _auto/ 子目录加载；自动生成的技能持久化回 _auto/。
//! 系统指令只注入 description 索引，完整 content 由 load_skill 工具按需加载。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 技能来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillSource {
    Manual,
    Conversation,
    Agent,
}

impl SkillSource {
    fn parse(s: &str) -> Self {
        match s {
            "agent" => SkillSource::Agent,
            "conversation" => SkillSource::Conversation,
            _ => SkillSource::Manual,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SkillSource::Manual => "manual",
            SkillSource::Conversation => "conversation",
            SkillSource::Agent => "agent",
        }
    }
}

/// 单个技能：轻量描述进系统指令，完整正文按需加载
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    pub source: SkillSource,
    #[serde(default)]
    pub auto_generated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Skill {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        source: SkillSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: description.into(),
            content: content.into(),
            tags: Vec::new(),
            version: 1,
            source,
            auto_generated: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn auto(mut self) -> Self {
        self.auto_generated = true;
        self
    }
}

/// 技能注册表：目录加载 + 程序注册 + _auto/ 持久化
pub struct SkillRegistry {
    skills: RwLock<HashMap<String, Skill>>,
    prompts_dir: PathBuf,
    auto_dir: PathBuf,
}

impl SkillRegistry {
    pub fn new(prompts_dir: impl AsRef<Path>) -> Self {
        let prompts_dir = prompts_dir.as_ref().to_path_buf();
        let auto_dir = prompts_dir.join("_auto");
        Self {
            skills: RwLock::new(HashMap::new()),
            prompts_dir,
            auto_dir,
        }
    }

    /// 扫描目录加载全部技能；_auto/ 下的默认 source=agent
    pub async fn load_all(&self) -> usize {
        let mut loaded = Vec::new();
        Self::load_dir(&self.prompts_dir, SkillSource::Manual, &mut loaded);
        Self::load_dir(&self.auto_dir, SkillSource::Agent, &mut loaded);

        let count = loaded.len();
        let mut skills = self.skills.write().await;
        for skill in loaded {
            tracing::info!(skill_name = %skill.name, source = skill.source.as_str(), "skill_loaded");
            skills.insert(skill.name.clone(), skill);
        }
        count
    }

    fn load_dir(dir: &Path, default_source: SkillSource, out: &mut Vec<Skill>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") || path.is_dir() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    if let Some(skill) = parse_skill_markdown(&content, default_source) {
                        out.push(skill);
                    } else {
                        tracing::warn!(path = %path.display(), "skill_file_invalid_frontmatter");
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skill_file_read_failed");
                }
            }
        }
    }

    /// 按名注册；重复注册覆盖
    pub async fn register(&self, skill: Skill) {
        tracing::info!(skill_name = %skill.name, "skill_registered");
        self.skills.write().await.insert(skill.name.clone(), skill);
    }

    /// 注册或增量更新：同名已存在时版本 +1、保留 created_at；auto_generated 技能落盘 _auto/
    pub async fn register_or_update(&self, mut skill: Skill) -> Skill {
        let mut skills = self.skills.write().await;
        let now = Utc::now();
        if let Some(existing) = skills.get(&skill.name) {
            skill.version = existing.version + 1;
            skill.created_at = existing.created_at;
        }
        skill.updated_at = now;

        if skill.auto_generated {
            if let Err(e) = self.persist_auto(&skill) {
                tracing::warn!(skill_name = %skill.name, error = %e, "skill_persist_failed");
            }
        }

        tracing::info!(
            skill_name = %skill.name,
            version = skill.version,
            auto_generated = skill.auto_generated,
            "skill_registered_or_updated"
        );
        skills.insert(skill.name.clone(), skill.clone());
        skill
    }

    /// 移除技能；自动生成的同时删除 _auto/ 下的文件
    pub async fn unregister(&self, name: &str) -> bool {
        let mut skills = self.skills.write().await;
        match skills.remove(name) {
            Some(skill) => {
                if skill.auto_generated {
                    let path = self.auto_dir.join(format!("{}.md", name));
                    let _ = std::fs::remove_file(path);
                }
                tracing::info!(skill_name = %name, "skill_unregistered");
                true
            }
            None => false,
        }
    }

    fn persist_auto(&self, skill: &Skill) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.auto_dir)?;
        let path = self.auto_dir.join(format!("{}.md", skill.name));
        std::fs::write(path, render_skill_markdown(skill))
    }

    pub async fn get(&self, name: &str) -> Option<Skill> {
        self.skills.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Skill> {
        let mut all: Vec<Skill> = self.skills.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// 系统指令中的技能索引段：只含名称与描述
    pub async fn skills_prompt(&self) -> String {
        let skills = self.list().await;
        if skills.is_empty() {
            return String::new();
        }

        let mut lines = vec![
            "## Available Skills".to_string(),
            String::new(),
            "Use the `load_skill` tool to load detailed instructions for a specific skill when needed.".to_string(),
            String::new(),
        ];
        for skill in &skills {
            let tag_str = if skill.tags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", skill.tags.join(", "))
            };
            let auto_str = if skill.auto_generated { " (auto)" } else { "" };
            lines.push(format!(
                "- **{}** (v{}){}: {}{}",
                skill.name, skill.version, auto_str, skill.description, tag_str
            ));
        }
        lines.join("\n")
    }
}

/// 解析技能 Markdown：--- frontmatter --- 正文
pub fn parse_skill_markdown(content: &str, default_source: SkillSource) -> Option<Skill> {
    let content = content.trim_start();
    if !content.starts_with("---") {
        return None;
    }
    let mut parts = content.splitn(3, "---");
    parts.next()?;
    let frontmatter = parts.next()?;
    let body = parts.next()?.trim().to_string();

    let mut fields: HashMap<&str, String> = HashMap::new();
    for line in frontmatter.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim(), value.trim().to_string());
        }
    }

    let name = fields.get("name")?.clone();
    let description = fields.get("description")?.clone();
    if name.is_empty() || description.is_empty() {
        return None;
    }

    let tags = fields
        .get("tags")
        .map(|t| {
            t.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let version = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let source = fields
        .get("source")
        .map(|s| SkillSource::parse(s))
        .unwrap_or(default_source);
    let auto_generated = fields
        .get("auto_generated")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default_source == SkillSource::Agent);

    let now = Utc::now();
    Some(Skill {
        name,
        description,
        content: body,
        tags,
        version,
        source,
        auto_generated,
        created_at: now,
        updated_at: now,
    })
}

/// 渲染为带 frontmatter 的 Markdown（_auto/ 持久化格式）
pub fn render_skill_markdown(skill: &Skill) -> String {
    format!(
        "---\nname: {}\ndescription: {}\ntags: {}\nversion: {}\nsource: {}\nauto_generated: {}\n---\n\n{}\n",
        skill.name,
        skill.description,
        skill.tags.join(", "),
        skill.version,
        skill.source.as_str(),
        skill.auto_generated,
        skill.content
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "---\nname: sql_query\ndescription: Write safe SQL queries\ntags: sql, database\n---\n\nAlways parameterize inputs.\n";

    #[test]
    fn test_parse_skill_markdown() {
        let skill = parse_skill_markdown(SAMPLE, SkillSource::Manual).unwrap();
        assert_eq!(skill.name, "sql_query");
        assert_eq!(skill.description, "Write safe SQL queries");
        assert_eq!(skill.tags, vec!["sql", "database"]);
        assert_eq!(skill.version, 1);
        assert!(skill.content.contains("parameterize"));
    }

    #[test]
    fn test_parse_rejects_missing_frontmatter() {
        assert!(parse_skill_markdown("no frontmatter here", SkillSource::Manual).is_none());
        assert!(parse_skill_markdown("---\ntags: x\n---\nbody", SkillSource::Manual).is_none());
    }

    #[test]
    fn test_render_roundtrip() {
        let skill = parse_skill_markdown(SAMPLE, SkillSource::Manual).unwrap();
        let rendered = render_skill_markdown(&skill);
        let reparsed = parse_skill_markdown(&rendered, SkillSource::Manual).unwrap();
        assert_eq!(reparsed.name, skill.name);
        assert_eq!(reparsed.content, skill.content);
    }

    #[tokio::test]
    async fn test_load_from_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("sql_query.md"), SAMPLE).unwrap();
        std::fs::create_dir_all(dir.path().join("_auto")).unwrap();
        std::fs::write(
            dir.path().join("_auto/report.md"),
            "---\nname: report\ndescription: Build reports\n---\nSteps.\n",
        )
        .unwrap();

        let registry = SkillRegistry::new(dir.path());
        assert_eq!(registry.load_all().await, 2);

        let auto = registry.get("report").await.unwrap();
        assert!(auto.auto_generated);
        assert_eq!(auto.source, SkillSource::Agent);

        let prompt = registry.skills_prompt().await;
        assert!(prompt.contains("sql_query"));
        assert!(prompt.contains("load_skill"));
        // 索引只含描述，不含正文
        assert!(!prompt.contains("parameterize"));
    }

    #[tokio::test]
    async fn test_register_or_update_bumps_version_and_persists() {
        let dir = TempDir::new().unwrap();
        let registry = SkillRegistry::new(dir.path());

        let v1 = Skill::new("fmt", "Formatting rules", "v1 body", SkillSource::Agent).auto();
        let registered = registry.register_or_update(v1).await;
        assert_eq!(registered.version, 1);

        let v2 = Skill::new("fmt", "Formatting rules", "v2 body", SkillSource::Agent).auto();
        let updated = registry.register_or_update(v2).await;
        assert_eq!(updated.version, 2);

        let on_disk = std::fs::read_to_string(dir.path().join("_auto/fmt.md")).unwrap();
        assert!(on_disk.contains("version: 2"));
        assert!(on_disk.contains("v2 body"));

        assert!(registry.unregister("fmt").await);
        assert!(!dir.path().join("_auto/fmt.md").exists());
    }
}
