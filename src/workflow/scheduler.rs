//! 工作流调度器
//!
//! 状态机：planner -> assigner -> worker_task*（并行）-> check -> {assigner | synthesizer}。
//! 每轮把依赖满足的步骤经 JoinSet 扇出，一个结果对应一个可交换合并；轮与轮之间
//! 严格有序（join 即轮边界）。单步失败落为 "Error: ..." 结果，下游照常执行；
//! 轮数超过 |steps| + 2 视为计划卡死。取消丢弃本轮部分结果，下次从 assigner 续跑。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::agent::{send_event, AgentDriver, AgentEvent, EventSender};
use crate::checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, PendingWrite};
use crate::core::{AgentError, Message, RequestContext};
use crate::llm::LlmGateway;
use crate::middleware::MiddlewareStack;
use crate::router::{WorkerConfig, WorkerRegistry};
use crate::tools::ToolRegistry;
use crate::workflow::planner::WorkflowPlanner;
use crate::workflow::types::{StepResult, WorkflowPlan, WorkflowState, WorkflowStep};

/// 工作流模式的检查点命名空间
pub const WORKFLOW_NAMESPACE: &str = "workflow";

/// 工作者任务执行契约；生产实现跑完整 Agent 循环，测试可替换
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn invoke(
        &self,
        worker: WorkerConfig,
        task_prompt: String,
        ctx: RequestContext,
    ) -> Result<String, AgentError>;
}

/// 生产实现：每个任务一个独立的 Agent 循环（隔离的内存检查点）
pub struct DriverWorkerRunner {
    gateway: Arc<LlmGateway>,
    registry: Arc<ToolRegistry>,
    worker_stack: Arc<dyn Fn(&WorkerConfig) -> MiddlewareStack + Send + Sync>,
    cycle_cap: usize,
}

impl DriverWorkerRunner {
    pub fn new(
        gateway: Arc<LlmGateway>,
        registry: Arc<ToolRegistry>,
        worker_stack: Arc<dyn Fn(&WorkerConfig) -> MiddlewareStack + Send + Sync>,
        cycle_cap: usize,
    ) -> Self {
        Self {
            gateway,
            registry,
            worker_stack,
            cycle_cap,
        }
    }
}

#[async_trait]
impl WorkerRunner for DriverWorkerRunner {
    async fn invoke(
        &self,
        worker: WorkerConfig,
        task_prompt: String,
        ctx: RequestContext,
    ) -> Result<String, AgentError> {
        let driver = AgentDriver::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.registry),
            (self.worker_stack)(&worker),
            Arc::new(MemoryCheckpointStore::new()),
        )
        .with_namespace("worker_task")
        .with_cycle_cap(self.cycle_cap);

        let outcome = driver
            .run(vec![Message::user(task_prompt)], &ctx, None)
            .await?;
        Ok(outcome
            .into_state()
            .last_assistant()
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }
}

/// 调度器
pub struct WorkflowScheduler {
    planner: WorkflowPlanner,
    workers: Arc<WorkerRegistry>,
    runner: Arc<dyn WorkerRunner>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl WorkflowScheduler {
    pub fn new(
        planner: WorkflowPlanner,
        workers: Arc<WorkerRegistry>,
        runner: Arc<dyn WorkerRunner>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            planner,
            workers,
            runner,
            checkpoints,
        }
    }

    async fn commit(
        &self,
        ctx: &RequestContext,
        state: &WorkflowState,
        parent: &mut Option<String>,
        batch: &[StepResult],
    ) -> Result<(), AgentError> {
        let writes: Vec<PendingWrite> = batch
            .iter()
            .enumerate()
            .map(|(i, r)| PendingWrite {
                task_id: r.step_id.clone(),
                idx: i as i64,
                channel: "completed_results".to_string(),
                value: serde_json::to_value(r).unwrap_or(serde_json::Value::Null),
            })
            .collect();

        let checkpoint = Checkpoint::new(
            ctx.session_id.clone(),
            WORKFLOW_NAMESPACE,
            parent.clone(),
            serde_json::to_value(state).unwrap_or(serde_json::Value::Null),
        );
        let id = checkpoint.checkpoint_id.clone();
        self.checkpoints
            .put(checkpoint, writes)
            .await
            .map_err(|e| AgentError::CheckpointUnavailable(e.to_string()))?;
        *parent = Some(id);
        Ok(())
    }

    async fn load(&self, ctx: &RequestContext) -> (WorkflowState, Option<String>) {
        match self
            .checkpoints
            .get_latest(&ctx.session_id, WORKFLOW_NAMESPACE)
            .await
        {
            Ok(Some(checkpoint)) => {
                let parent = Some(checkpoint.checkpoint_id.clone());
                match serde_json::from_value::<WorkflowState>(checkpoint.channel_values) {
                    Ok(state) if state.final_output.is_empty() => (state, parent),
                    // 上次已收尾：新请求重新规划
                    Ok(_) => (WorkflowState::default(), parent),
                    Err(e) => {
                        tracing::warn!(error = %e, "workflow_state_restore_failed");
                        (WorkflowState::default(), parent)
                    }
                }
            }
            _ => (WorkflowState::default(), None),
        }
    }

    /// 执行工作流直到合成或卡死
    pub async fn run(
        &self,
        incoming: Vec<Message>,
        ctx: &RequestContext,
        template_name: Option<&str>,
        events: Option<&EventSender>,
    ) -> Result<WorkflowState, AgentError> {
        let (mut state, mut parent) = self.load(ctx).await;

        if state.plan.is_none() {
            state.messages.extend(incoming);
            let user_message = state
                .messages
                .iter()
                .rev()
                .find(|m| m.role == crate::core::Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();

            let plan = self.planner.plan(&user_message, template_name, ctx).await;
            tracing::info!(
                session_id = %ctx.session_id,
                plan_name = %plan.name,
                step_count = plan.steps.len(),
                "workflow_plan_created"
            );
            state.plan = Some(plan);
            state.current_round = 0;
            self.commit(ctx, &state, &mut parent, &[]).await?;
        } else {
            // 取消后重入：保留计划与已提交结果，从 assigner 续跑
            state.messages.extend(incoming);
            tracing::info!(
                session_id = %ctx.session_id,
                completed = state.completed_results.len(),
                "workflow_resumed"
            );
        }

        let plan = match state.plan.clone() {
            Some(p) => p,
            None => {
                return Err(AgentError::ConfigError(
                    "workflow state missing plan".to_string(),
                ))
            }
        };
        let round_cap = plan.steps.len() + 2;

        loop {
            if state.is_complete() {
                break;
            }

            let eligible = state.eligible_steps();
            if eligible.is_empty() {
                // 校验过的计划不应走到这里；防御性收尾
                tracing::warn!(session_id = %ctx.session_id, "workflow_no_eligible_steps");
                break;
            }

            if state.current_round >= round_cap {
                let notice = format!(
                    "Error: workflow plan stuck after {} rounds ({} of {} steps completed); aborting.",
                    state.current_round,
                    state.completed_results.len(),
                    plan.steps.len()
                );
                tracing::warn!(session_id = %ctx.session_id, rounds = state.current_round, "workflow_plan_stuck");
                send_event(&events, AgentEvent::Error { text: notice.clone() });
                state.final_output = notice.clone();
                state.messages.push(Message::assistant(notice));
                self.commit(ctx, &state, &mut parent, &[]).await?;
                return Ok(state);
            }

            send_event(
                &events,
                AgentEvent::RoundStarted {
                    round: state.current_round,
                    steps: eligible.iter().map(|s| s.id.clone()).collect(),
                },
            );
            tracing::info!(
                session_id = %ctx.session_id,
                round = state.current_round,
                worker_count = eligible.len(),
                "workflow_workers_assigned"
            );

            let batch = match self.scatter_round(&state, eligible, ctx, events).await {
                Some(batch) => batch,
                // 取消：部分结果丢弃，检查点停留在上一轮
                None => return Ok(state),
            };

            state
                .merge_results(batch.clone())
                .map_err(|e| AgentError::SchemaViolation(e.to_string()))?;
            state.current_round += 1;
            self.commit(ctx, &state, &mut parent, &batch).await?;
        }

        let final_output = synthesize(&plan, &state);
        state.final_output = final_output.clone();
        state.messages.push(Message::assistant(final_output));
        self.commit(ctx, &state, &mut parent, &[]).await?;
        tracing::info!(
            session_id = %ctx.session_id,
            step_count = state.completed_results.len(),
            "workflow_synthesis_completed"
        );
        Ok(state)
    }

    /// 一轮扇出 + 聚合；取消时返回 None（丢弃部分结果）
    async fn scatter_round(
        &self,
        state: &WorkflowState,
        eligible: Vec<WorkflowStep>,
        ctx: &RequestContext,
        events: Option<&EventSender>,
    ) -> Option<Vec<StepResult>> {
        let mut join_set: JoinSet<StepResult> = JoinSet::new();

        for step in eligible {
            let dep_context = state.dependency_context(&step);
            let task_prompt = if dep_context.is_empty() {
                step.task.clone()
            } else {
                format!("{}\n\n## Context from previous steps\n{}", step.task, dep_context)
            };

            let worker_config = self.workers.get(&step.worker).await;
            let runner = Arc::clone(&self.runner);
            let task_ctx = ctx.clone();

            join_set.spawn(async move {
                let output = match worker_config {
                    Some(config) => {
                        match runner.invoke(config, task_prompt, task_ctx).await {
                            Ok(output) => output,
                            Err(e) => format!("Error: {}", e),
                        }
                    }
                    None => format!("Error: worker '{}' not found", step.worker),
                };
                StepResult {
                    step_id: step.id,
                    worker: step.worker,
                    task: step.task,
                    output,
                }
            });
        }

        let mut batch = Vec::new();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    join_set.shutdown().await;
                    tracing::info!(session_id = %ctx.session_id, "workflow_round_cancelled");
                    return None;
                }
                next = join_set.join_next() => match next {
                    Some(Ok(result)) => {
                        send_event(
                            &events,
                            AgentEvent::StepCompleted {
                                step_id: result.step_id.clone(),
                                worker: result.worker.clone(),
                            },
                        );
                        batch.push(result);
                    }
                    Some(Err(e)) => {
                        // 任务 panic：该步本轮无结果，轮上限兜底
                        tracing::warn!(error = %e, "workflow_worker_task_panicked");
                    }
                    None => break,
                },
            }
        }
        Some(batch)
    }
}

/// 合成器：按计划顺序把各步输出折叠为一条 assistant 消息
pub fn synthesize(plan: &WorkflowPlan, state: &WorkflowState) -> String {
    if state.completed_results.is_empty() {
        return "No results to synthesize.".to_string();
    }

    let sections: Vec<String> = plan
        .steps
        .iter()
        .filter_map(|step| {
            state
                .completed_results
                .iter()
                .find(|r| r.step_id == step.id)
                .map(|r| {
                    let task_preview: String = r.task.chars().take(200).collect();
                    format!(
                        "### Step: {} (Worker: {})\n**Task**: {}\n\n{}",
                        r.step_id, r.worker, task_preview, r.output
                    )
                })
        })
        .collect();

    format!(
        "# Workflow Results: {}\n*Completed {} steps*\n\n{}",
        plan.name,
        state.completed_results.len(),
        sections.join("\n\n---\n\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::LlmSection;
    use crate::llm::{LlmGateway, LlmReply, ScriptedLlm};
    use crate::workflow::templates::TemplateRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 返回 step id 大写；记录并发峰值
    struct UppercaseRunner {
        active: AtomicUsize,
        peak: AtomicUsize,
        delay_ms: u64,
    }

    impl UppercaseRunner {
        fn new(delay_ms: u64) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay_ms,
            }
        }
    }

    #[async_trait]
    impl WorkerRunner for UppercaseRunner {
        async fn invoke(
            &self,
            _worker: WorkerConfig,
            task_prompt: String,
            _ctx: RequestContext,
        ) -> Result<String, AgentError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            // 任务文本首词是步骤 id（测试计划如此构造）
            let id = task_prompt.split_whitespace().next().unwrap_or("?");
            Ok(id.to_uppercase())
        }
    }

    fn three_step_plan() -> WorkflowPlan {
        WorkflowPlan {
            name: "parallel_then_join".to_string(),
            reasoning: String::new(),
            steps: vec![
                WorkflowStep {
                    id: "a".to_string(),
                    worker: "researcher".to_string(),
                    task: "a gather part one".to_string(),
                    depends_on: vec![],
                },
                WorkflowStep {
                    id: "b".to_string(),
                    worker: "researcher".to_string(),
                    task: "b gather part two".to_string(),
                    depends_on: vec![],
                },
                WorkflowStep {
                    id: "c".to_string(),
                    worker: "analyst".to_string(),
                    task: "c combine".to_string(),
                    depends_on: vec!["a".to_string(), "b".to_string()],
                },
            ],
        }
    }

    fn scheduler_with_runner(
        runner: Arc<dyn WorkerRunner>,
        store: Arc<MemoryCheckpointStore>,
        planner_reply: &str,
    ) -> WorkflowScheduler {
        let llm = Arc::new(ScriptedLlm::new(vec![LlmReply::text(planner_reply)]));
        let gateway = Arc::new(LlmGateway::single(llm, &LlmSection::default()));
        let workers = Arc::new(WorkerRegistry::with_defaults());
        let planner = WorkflowPlanner::new(
            Arc::clone(&gateway),
            Arc::new(TemplateRegistry::empty()),
            Arc::clone(&workers),
        );
        WorkflowScheduler::new(planner, workers, runner, store)
    }

    fn plan_json(plan: &WorkflowPlan) -> String {
        serde_json::to_string(&serde_json::json!({
            "name": plan.name,
            "reasoning": "test",
            "steps": plan.steps.iter().map(|s| serde_json::json!({
                "id": s.id, "worker": s.worker, "task": s.task, "depends_on": s.depends_on,
            })).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_parallel_round_then_dependent_round() {
        let runner = Arc::new(UppercaseRunner::new(30));
        let store = Arc::new(MemoryCheckpointStore::new());
        let scheduler = scheduler_with_runner(
            Arc::clone(&runner) as Arc<dyn WorkerRunner>,
            store,
            &plan_json(&three_step_plan()),
        );

        let ctx = RequestContext::new("wf1");
        let state = scheduler
            .run(vec![Message::user("compare one and two")], &ctx, None, None)
            .await
            .unwrap();

        // a、b 并行（并发峰值 >= 2），c 在第二轮
        assert!(runner.peak.load(Ordering::SeqCst) >= 2);
        assert_eq!(state.completed_results.len(), 3);
        assert!(state.is_complete());
        assert_eq!(state.current_round, 2);

        // 合成按计划顺序
        let output = &state.final_output;
        assert!(output.contains("parallel_then_join"));
        let a_pos = output.find("Step: a").unwrap();
        let b_pos = output.find("Step: b").unwrap();
        let c_pos = output.find("Step: c").unwrap();
        assert!(a_pos < b_pos && b_pos < c_pos);
    }

    #[tokio::test]
    async fn test_dependency_context_visible_to_downstream() {
        struct ContextProbe;

        #[async_trait]
        impl WorkerRunner for ContextProbe {
            async fn invoke(
                &self,
                _worker: WorkerConfig,
                task_prompt: String,
                _ctx: RequestContext,
            ) -> Result<String, AgentError> {
                if task_prompt.starts_with("c ") {
                    // 下游步骤应看到两个上游输出
                    assert!(task_prompt.contains("[Result from a]"));
                    assert!(task_prompt.contains("[Result from b]"));
                    assert!(task_prompt.contains("A-OUT"));
                    assert!(task_prompt.contains("B-OUT"));
                    return Ok("C-OUT".to_string());
                }
                let id = task_prompt.split_whitespace().next().unwrap_or("?");
                Ok(format!("{}-OUT", id.to_uppercase()))
            }
        }

        let store = Arc::new(MemoryCheckpointStore::new());
        let scheduler = scheduler_with_runner(
            Arc::new(ContextProbe),
            store,
            &plan_json(&three_step_plan()),
        );
        let ctx = RequestContext::new("wf2");
        let state = scheduler
            .run(vec![Message::user("go")], &ctx, None, None)
            .await
            .unwrap();
        assert!(state.final_output.contains("C-OUT"));
    }

    #[tokio::test]
    async fn test_failed_step_shapes_error_and_downstream_runs() {
        struct FailingRunner;

        #[async_trait]
        impl WorkerRunner for FailingRunner {
            async fn invoke(
                &self,
                _worker: WorkerConfig,
                task_prompt: String,
                _ctx: RequestContext,
            ) -> Result<String, AgentError> {
                if task_prompt.starts_with("a ") {
                    Err(AgentError::UpstreamUnavailable("model melted".to_string()))
                } else {
                    Ok("fine".to_string())
                }
            }
        }

        let store = Arc::new(MemoryCheckpointStore::new());
        let scheduler = scheduler_with_runner(
            Arc::new(FailingRunner),
            store,
            &plan_json(&three_step_plan()),
        );
        let ctx = RequestContext::new("wf3");
        let state = scheduler
            .run(vec![Message::user("go")], &ctx, None, None)
            .await
            .unwrap();

        assert!(state.is_complete());
        let a = state
            .completed_results
            .iter()
            .find(|r| r.step_id == "a")
            .unwrap();
        assert!(a.output.starts_with("Error:"));
        // 依赖 a 的 c 仍然执行
        assert!(state.completed_results.iter().any(|r| r.step_id == "c"));
    }

    #[tokio::test]
    async fn test_cancellation_discards_inflight_round() {
        let runner = Arc::new(UppercaseRunner::new(5_000));
        let store = Arc::new(MemoryCheckpointStore::new());
        let scheduler = scheduler_with_runner(
            runner as Arc<dyn WorkerRunner>,
            Arc::clone(&store),
            &plan_json(&three_step_plan()),
        );

        let ctx = RequestContext::new("wf4");
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let state = scheduler
            .run(vec![Message::user("go")], &ctx, None, None)
            .await
            .unwrap();

        // 第一轮未完成即取消：无已提交结果，计划保留在检查点
        assert!(state.completed_results.is_empty());
        assert!(state.final_output.is_empty());
        assert_eq!(store.count("wf4", WORKFLOW_NAMESPACE).await, 1);
    }

    #[tokio::test]
    async fn test_resume_after_cancellation_reuses_plan() {
        let store = Arc::new(MemoryCheckpointStore::new());
        {
            let runner = Arc::new(UppercaseRunner::new(5_000));
            let scheduler = scheduler_with_runner(
                runner as Arc<dyn WorkerRunner>,
                Arc::clone(&store),
                &plan_json(&three_step_plan()),
            );
            let ctx = RequestContext::new("wf5");
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
            scheduler
                .run(vec![Message::user("go")], &ctx, None, None)
                .await
                .unwrap();
        }

        // 重入：规划器脚本只会被忽略（计划来自检查点）
        let runner = Arc::new(UppercaseRunner::new(10));
        let scheduler = scheduler_with_runner(
            runner as Arc<dyn WorkerRunner>,
            Arc::clone(&store),
            "not json",
        );
        let ctx = RequestContext::new("wf5");
        let state = scheduler.run(vec![], &ctx, None, None).await.unwrap();

        assert!(state.is_complete());
        assert_eq!(state.plan.as_ref().unwrap().name, "parallel_then_join");
    }

    #[test]
    fn test_synthesize_empty_results() {
        let state = WorkflowState::default();
        assert_eq!(synthesize(&three_step_plan(), &state), "No results to synthesize.");
    }
}
