//! YAML 工作流模板
//!
//! 启动时扫描模板目录解析 .yaml/.yml；模板按名查找，并为规划器渲染提示段。
//! 使用模板时把用户原始请求注入每个步骤的任务文本。

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::workflow::types::{WorkflowPlan, WorkflowStep};

#[derive(Debug, Deserialize)]
struct TemplateFile {
    name: String,
    #[serde(default)]
    description: String,
    steps: Vec<WorkflowStep>,
}

/// 模板注册表（启动时装载，只读共享）
#[derive(Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, (WorkflowPlan, String)>,
}

impl TemplateRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 扫描目录；单个文件解析失败只记日志
    pub fn load_dir(dir: impl AsRef<Path>) -> Self {
        let mut registry = Self::default();
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => {
                tracing::info!(path = %dir.display(), "workflow_templates_dir_not_found");
                return registry;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| serde_yaml::from_str::<TemplateFile>(&content).map_err(|e| e.to_string()))
            {
                Ok(file) => {
                    let plan = WorkflowPlan {
                        name: file.name.clone(),
                        reasoning: format!(
                            "Loaded from template: {}",
                            path.file_name().and_then(|n| n.to_str()).unwrap_or("?")
                        ),
                        steps: file.steps,
                    };
                    if let Err(e) = plan.validate() {
                        tracing::warn!(template = %file.name, error = %e, "workflow_template_invalid");
                        continue;
                    }
                    tracing::info!(
                        template_name = %file.name,
                        step_count = plan.steps.len(),
                        "workflow_template_loaded"
                    );
                    registry
                        .templates
                        .insert(file.name, (plan, file.description));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "workflow_template_parse_failed");
                }
            }
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowPlan> {
        self.templates.get(name).map(|(plan, _)| plan)
    }

    /// (name, description) 列表
    pub fn list(&self) -> Vec<(String, String)> {
        self.templates
            .iter()
            .map(|(name, (_, desc))| (name.clone(), desc.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// 规划器提示段：模板名、描述与工作者流
    pub fn prompt_section(&self) -> String {
        if self.templates.is_empty() {
            return "No predefined workflow templates available.".to_string();
        }
        let mut lines = vec!["## Available Workflow Templates".to_string()];
        for (name, (plan, desc)) in &self.templates {
            let flow = plan
                .steps
                .iter()
                .map(|s| format!("{}({})", s.worker, s.id))
                .collect::<Vec<_>>()
                .join(" -> ");
            lines.push(format!("- **{}**: {}", name, desc));
            lines.push(format!("  Flow: {}", flow));
        }
        lines.join("\n")
    }

    /// 消息中出现模板名则按启发匹配
    pub fn match_by_heuristic(&self, user_message: &str) -> Option<&WorkflowPlan> {
        let lower = user_message.to_lowercase();
        self.templates
            .iter()
            .find(|(name, _)| lower.contains(&name.to_lowercase()))
            .map(|(_, (plan, _))| plan)
    }
}

/// 模板步骤注入用户原始请求
pub fn inject_user_context(plan: &WorkflowPlan, user_message: &str) -> WorkflowPlan {
    WorkflowPlan {
        name: plan.name.clone(),
        reasoning: plan.reasoning.clone(),
        steps: plan
            .steps
            .iter()
            .map(|s| WorkflowStep {
                id: s.id.clone(),
                worker: s.worker.clone(),
                task: format!("{}\n\nUser's original request: {}", s.task, user_message),
                depends_on: s.depends_on.clone(),
            })
            .collect(),
    }
}
