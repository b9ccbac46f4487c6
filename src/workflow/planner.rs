//! 工作流规划器
//!
//! 优先级：显式模板名 > 模板启发匹配 > LLM 动态规划 > 单步回退（coder）。
//! LLM 规划的步骤中未知工作者被丢弃；JSON 解析失败或校验失败落入回退。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::{Message, RequestContext};
use crate::llm::LlmGateway;
use crate::router::WorkerRegistry;
use crate::workflow::templates::{inject_user_context, TemplateRegistry};
use crate::workflow::types::{WorkflowPlan, WorkflowStep};

#[derive(Debug, Deserialize)]
struct PlanDraft {
    #[serde(default)]
    name: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    steps: Vec<StepDraft>,
}

#[derive(Debug, Deserialize)]
struct StepDraft {
    #[serde(default)]
    id: String,
    #[serde(default)]
    worker: String,
    #[serde(default)]
    task: String,
    #[serde(default)]
    depends_on: Vec<String>,
}

pub struct WorkflowPlanner {
    gateway: Arc<LlmGateway>,
    templates: Arc<TemplateRegistry>,
    workers: Arc<WorkerRegistry>,
}

impl WorkflowPlanner {
    pub fn new(
        gateway: Arc<LlmGateway>,
        templates: Arc<TemplateRegistry>,
        workers: Arc<WorkerRegistry>,
    ) -> Self {
        Self {
            gateway,
            templates,
            workers,
        }
    }

    /// 生成计划；绝不失败（最终落到回退计划）
    pub async fn plan(
        &self,
        user_message: &str,
        template_name: Option<&str>,
        ctx: &RequestContext,
    ) -> WorkflowPlan {
        // 1. 显式模板
        if let Some(name) = template_name {
            if let Some(template) = self.templates.get(name) {
                tracing::info!(
                    template_name = %name,
                    step_count = template.steps.len(),
                    "workflow_template_matched"
                );
                return inject_user_context(template, user_message);
            }
            tracing::warn!(template_name = %name, "workflow_template_unknown");
        }

        // 2. 启发匹配
        if let Some(template) = self.templates.match_by_heuristic(user_message) {
            tracing::info!(template_name = %template.name, "workflow_template_heuristic_matched");
            return inject_user_context(template, user_message);
        }

        // 3. LLM 动态规划
        match self.llm_plan(user_message, ctx).await {
            Some(plan) => plan,
            // 4. 回退
            None => WorkflowPlan::fallback(
                user_message,
                "Planning failed, falling back to a single coder step.",
            ),
        }
    }

    async fn planning_prompt(&self) -> String {
        let workers = self.workers.list().await;
        let catalog = workers
            .iter()
            .map(|w| format!("- **{}**: {}", w.name, w.description))
            .collect::<Vec<_>>()
            .join("\n");
        let names = workers
            .iter()
            .map(|w| w.name.clone())
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "You are a Workflow Planner. Break the user's request into a multi-step execution plan, \
             assigning each step to the most appropriate worker.\n\n\
             ## Available Workers\n{}\n\n{}\n\n\
             ## Instructions\n\
             1. Each step must specify: id, worker, task, depends_on.\n\
             2. Steps without dependencies run in parallel; depends_on entries must reference earlier step ids.\n\
             3. Use 2-5 focused steps.\n\n\
             ## Output Format\n\
             Respond with ONLY a JSON object:\n\
             {{\"name\": \"workflow_name\", \"reasoning\": \"brief explanation\", \"steps\": \
             [{{\"id\": \"step_1\", \"worker\": \"researcher\", \"task\": \"...\", \"depends_on\": []}}]}}\n\n\
             Valid worker names: {}",
            catalog,
            self.templates.prompt_section(),
            names
        )
    }

    async fn llm_plan(&self, user_message: &str, ctx: &RequestContext) -> Option<WorkflowPlan> {
        let messages = vec![
            Message::directive(self.planning_prompt().await),
            Message::user(user_message.to_string()),
        ];

        let reply = match self.gateway.call(&messages, &[], ctx).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "workflow_planning_llm_failed");
                return None;
            }
        };

        let json = extract_json(&reply.text)?;
        let draft: PlanDraft = match serde_json::from_str(json) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "workflow_plan_json_parse_failed");
                return None;
            }
        };

        let known = self.workers.names().await;
        let mut steps = Vec::new();
        for (i, s) in draft.steps.into_iter().enumerate() {
            if !known.contains(&s.worker) {
                tracing::warn!(worker = %s.worker, "workflow_planner_unknown_worker");
                continue;
            }
            steps.push(WorkflowStep {
                id: if s.id.is_empty() {
                    format!("step_{}", i + 1)
                } else {
                    s.id
                },
                worker: s.worker,
                task: s.task,
                depends_on: s.depends_on,
            });
        }

        let plan = WorkflowPlan {
            name: if draft.name.is_empty() {
                "dynamic".to_string()
            } else {
                draft.name
            },
            reasoning: draft.reasoning,
            steps,
        };

        match plan.validate() {
            Ok(()) => {
                tracing::info!(
                    plan_name = %plan.name,
                    step_count = plan.steps.len(),
                    "workflow_plan_generated"
                );
                Some(plan)
            }
            Err(e) => {
                tracing::warn!(error = %e, "workflow_plan_invalid");
                None
            }
        }
    }
}

/// 提取 JSON（```json 围栏或首个 {...}）
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSection;
    use crate::llm::{LlmReply, ScriptedLlm};

    fn planner_with(replies: Vec<LlmReply>, templates: TemplateRegistry) -> WorkflowPlanner {
        let llm = Arc::new(ScriptedLlm::new(replies));
        WorkflowPlanner::new(
            Arc::new(LlmGateway::single(llm, &LlmSection::default())),
            Arc::new(templates),
            Arc::new(WorkerRegistry::with_defaults()),
        )
    }

    #[tokio::test]
    async fn test_llm_plan_parsed_and_validated() {
        let planner = planner_with(
            vec![LlmReply::text(
                "```json\n{\"name\": \"compare\", \"reasoning\": \"two sources then analysis\", \"steps\": [\
                 {\"id\": \"a\", \"worker\": \"researcher\", \"task\": \"find A\", \"depends_on\": []},\
                 {\"id\": \"b\", \"worker\": \"researcher\", \"task\": \"find B\", \"depends_on\": []},\
                 {\"id\": \"c\", \"worker\": \"analyst\", \"task\": \"compare\", \"depends_on\": [\"a\", \"b\"]}]}\n```",
            )],
            TemplateRegistry::empty(),
        );
        let ctx = RequestContext::new("s1");
        let plan = planner.plan("compare A and B", None, &ctx).await;

        assert_eq!(plan.name, "compare");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[2].depends_on, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unknown_worker_dropped_then_fallback_on_empty() {
        let planner = planner_with(
            vec![LlmReply::text(
                "{\"name\": \"x\", \"steps\": [{\"id\": \"a\", \"worker\": \"wizard\", \"task\": \"magic\", \"depends_on\": []}]}",
            )],
            TemplateRegistry::empty(),
        );
        let ctx = RequestContext::new("s1");
        let plan = planner.plan("do magic", None, &ctx).await;

        // 唯一步骤的工作者未知 -> 计划为空 -> 回退
        assert_eq!(plan.name, "fallback");
        assert_eq!(plan.steps[0].worker, "coder");
        assert_eq!(plan.steps[0].task, "do magic");
    }

    #[tokio::test]
    async fn test_parse_failure_falls_back() {
        let planner = planner_with(
            vec![LlmReply::text("I think we should do several things...")],
            TemplateRegistry::empty(),
        );
        let ctx = RequestContext::new("s1");
        let plan = planner.plan("anything", None, &ctx).await;
        assert_eq!(plan.name, "fallback");
    }

    #[tokio::test]
    async fn test_explicit_template_takes_precedence() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("review.yaml"),
            "name: review\ndescription: Code review flow\nsteps:\n  - id: read\n    worker: researcher\n    task: Read the diff\n",
        )
        .unwrap();
        let templates = TemplateRegistry::load_dir(dir.path());

        // LLM 不应被调用：给一个会失败的脚本也无妨
        let planner = planner_with(vec![], templates);
        let ctx = RequestContext::new("s1");
        let plan = planner.plan("check my patch", Some("review"), &ctx).await;

        assert_eq!(plan.name, "review");
        assert!(plan.steps[0].task.contains("check my patch"));
    }
}
