//! 工作流类型定义
//!
//! 计划是步骤的 DAG：step id 唯一，depends_on 只能引用先前声明的 id（因此必然无环）。
//! completed_results 是按 step_id 的集合并（可交换、可结合），并行任务完成顺序不影响状态。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Message;

/// 工作流错误类型
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("Step {step} depends on unknown or later step: {dep}")]
    UnknownDependency { step: String, dep: String },

    #[error("Plan has no steps")]
    EmptyPlan,

    /// 同一 step_id 的结果重复写入
    #[error("Duplicate result for step: {0}")]
    DuplicateResult(String),
}

/// 单个计划步骤
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub worker: String,
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// 工作流计划
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub name: String,
    #[serde(default)]
    pub reasoning: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowPlan {
    /// 校验：非空、id 唯一、依赖只引用先前的 id
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::EmptyPlan);
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::DuplicateStepId(step.id.clone()));
            }
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) || dep == &step.id {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// 单步回退计划（规划失败时）
    pub fn fallback(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: "fallback".to_string(),
            reasoning: reason.into(),
            steps: vec![WorkflowStep {
                id: "step_1".to_string(),
                worker: "coder".to_string(),
                task: task.into(),
                depends_on: Vec::new(),
            }],
        }
    }
}

/// 单步执行结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub worker: String,
    pub task: String,
    pub output: String,
}

/// 工作流状态；completed_results 只增，合并为按 step_id 的不相交并
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    pub messages: Vec<Message>,
    pub plan: Option<WorkflowPlan>,
    pub completed_results: Vec<StepResult>,
    pub current_round: usize,
    pub final_output: String,
}

impl WorkflowState {
    pub fn completed_ids(&self) -> HashSet<&str> {
        self.completed_results
            .iter()
            .map(|r| r.step_id.as_str())
            .collect()
    }

    /// 本轮可执行步骤：未完成且依赖全部满足
    pub fn eligible_steps(&self) -> Vec<WorkflowStep> {
        let Some(plan) = &self.plan else {
            return Vec::new();
        };
        let completed = self.completed_ids();
        plan.steps
            .iter()
            .filter(|s| !completed.contains(s.id.as_str()))
            .filter(|s| s.depends_on.iter().all(|d| completed.contains(d.as_str())))
            .cloned()
            .collect()
    }

    /// 全部步骤是否完成
    pub fn is_complete(&self) -> bool {
        match &self.plan {
            Some(plan) => {
                let completed = self.completed_ids();
                plan.steps.iter().all(|s| completed.contains(s.id.as_str()))
            }
            None => false,
        }
    }

    /// 可交换合并：并入一批结果并按 step_id 排序；重复 id 是错误
    pub fn merge_results(&mut self, batch: Vec<StepResult>) -> Result<(), WorkflowError> {
        let existing = self
            .completed_results
            .iter()
            .map(|r| r.step_id.clone())
            .collect::<HashSet<_>>();
        let mut incoming: HashSet<String> = HashSet::new();
        for result in &batch {
            if existing.contains(&result.step_id) || !incoming.insert(result.step_id.clone()) {
                return Err(WorkflowError::DuplicateResult(result.step_id.clone()));
            }
        }
        self.completed_results.extend(batch);
        self.completed_results.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(())
    }

    /// 依赖上下文：按依赖声明顺序串接各依赖的输出
    pub fn dependency_context(&self, step: &WorkflowStep) -> String {
        if step.depends_on.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                self.completed_results
                    .iter()
                    .find(|r| &r.step_id == dep)
                    .map(|r| format!("[Result from {}]:\n{}", dep, r.output))
            })
            .collect();
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            worker: "researcher".to_string(),
            task: format!("task {}", id),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn result(id: &str, output: &str) -> StepResult {
        StepResult {
            step_id: id.to_string(),
            worker: "researcher".to_string(),
            task: format!("task {}", id),
            output: output.to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_dag() {
        let plan = WorkflowPlan {
            name: "p".to_string(),
            reasoning: String::new(),
            steps: vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])],
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_forward_deps() {
        let dup = WorkflowPlan {
            name: "p".to_string(),
            reasoning: String::new(),
            steps: vec![step("a", &[]), step("a", &[])],
        };
        assert!(matches!(dup.validate(), Err(WorkflowError::DuplicateStepId(_))));

        let forward = WorkflowPlan {
            name: "p".to_string(),
            reasoning: String::new(),
            steps: vec![step("a", &["b"]), step("b", &[])],
        };
        assert!(matches!(
            forward.validate(),
            Err(WorkflowError::UnknownDependency { .. })
        ));

        let empty = WorkflowPlan {
            name: "p".to_string(),
            reasoning: String::new(),
            steps: vec![],
        };
        assert!(matches!(empty.validate(), Err(WorkflowError::EmptyPlan)));
    }

    #[test]
    fn test_eligible_steps_respect_dependencies() {
        let mut state = WorkflowState {
            plan: Some(WorkflowPlan {
                name: "p".to_string(),
                reasoning: String::new(),
                steps: vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])],
            }),
            ..Default::default()
        };

        let eligible: Vec<String> = state.eligible_steps().iter().map(|s| s.id.clone()).collect();
        assert_eq!(eligible, vec!["a", "b"]);

        state.merge_results(vec![result("a", "A")]).unwrap();
        let eligible: Vec<String> = state.eligible_steps().iter().map(|s| s.id.clone()).collect();
        assert_eq!(eligible, vec!["b"]);

        state.merge_results(vec![result("b", "B")]).unwrap();
        let eligible: Vec<String> = state.eligible_steps().iter().map(|s| s.id.clone()).collect();
        assert_eq!(eligible, vec!["c"]);
        assert!(!state.is_complete());

        state.merge_results(vec![result("c", "C")]).unwrap();
        assert!(state.is_complete());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let plan = WorkflowPlan {
            name: "p".to_string(),
            reasoning: String::new(),
            steps: vec![step("a", &[]), step("b", &[])],
        };

        let mut forward = WorkflowState {
            plan: Some(plan.clone()),
            ..Default::default()
        };
        forward.merge_results(vec![result("a", "A")]).unwrap();
        forward.merge_results(vec![result("b", "B")]).unwrap();

        let mut backward = WorkflowState {
            plan: Some(plan),
            ..Default::default()
        };
        backward.merge_results(vec![result("b", "B")]).unwrap();
        backward.merge_results(vec![result("a", "A")]).unwrap();

        assert_eq!(forward.completed_results, backward.completed_results);
    }

    #[test]
    fn test_merge_rejects_duplicate_step_id() {
        let mut state = WorkflowState::default();
        state.merge_results(vec![result("a", "A")]).unwrap();
        let err = state.merge_results(vec![result("a", "again")]).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateResult(_)));
        // 原结果未被覆盖
        assert_eq!(state.completed_results[0].output, "A");
    }

    #[test]
    fn test_dependency_context_in_declaration_order() {
        let mut state = WorkflowState::default();
        state
            .merge_results(vec![result("b", "B-out"), result("a", "A-out")])
            .unwrap();

        let c = step("c", &["a", "b"]);
        let context = state.dependency_context(&c);
        let a_pos = context.find("A-out").unwrap();
        let b_pos = context.find("B-out").unwrap();
        assert!(a_pos < b_pos);
        assert!(context.contains("[Result from a]"));
    }
}
