//! 工作流层：计划类型、YAML 模板、规划器与并行调度器

pub mod planner;
pub mod scheduler;
pub mod templates;
pub mod types;

pub use planner::WorkflowPlanner;
pub use scheduler::{
    synthesize, DriverWorkerRunner, WorkerRunner, WorkflowScheduler, WORKFLOW_NAMESPACE,
};
pub use templates::{inject_user_context, TemplateRegistry};
pub use types::{StepResult, WorkflowError, WorkflowPlan, WorkflowState, WorkflowStep};
