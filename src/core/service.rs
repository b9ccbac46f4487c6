//! 服务入口：按模式分发请求
//!
//! 启动时装配全部注册表（工具、技能、工作者、模板、审批门），每个请求构造对应驱动器。
//! 同一会话同一时刻至多一个活跃循环（按 session_id 的互斥锁串行）；不同会话并行。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::agent::{emit_chunks_and_done, AgentDriver, EventReceiver, EventSender};
use crate::approval::{spawn_sweeper, ApprovalGate, ApprovalRequest};
use crate::checkpoint::CheckpointStore;
use crate::config::AppConfig;
use crate::core::{AgentError, AgentState, Message, RequestContext};
use crate::llm::LlmGateway;
use crate::middleware::{
    ApprovalMiddleware, CompactionMiddleware, DirectiveMiddleware, MetricsMiddleware,
    MiddlewareStack, ObservabilityMiddleware, RoleFilterMiddleware,
};
use crate::observability::Metrics;
use crate::router::{MultiAgentRouter, WorkerConfig, WorkerRegistry};
use crate::skills::{SkillCreator, SkillRegistry};
use crate::tools::{
    discover, load_bridge_configs, CreateSkillTool, HttpToolBridge, KnowledgeRetriever,
    ListSkillsTool, LoadSkillTool, RetrieveKnowledgeTool, ToolRegistry, UpdateSkillTool,
};
use crate::workflow::{
    DriverWorkerRunner, TemplateRegistry, WorkflowPlanner, WorkflowScheduler,
};

/// 请求模式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Single,
    Multi,
    Workflow,
}

/// 一次 execute 调用的入参
#[derive(Clone, Debug)]
pub struct ExecuteRequest {
    pub mode: ExecutionMode,
    pub session_id: String,
    pub user_id: Option<String>,
    pub role: String,
    pub messages: Vec<Message>,
    /// 工作流模式下的显式模板名
    pub template: Option<String>,
}

type WorkerStackFn = Arc<dyn Fn(&WorkerConfig) -> MiddlewareStack + Send + Sync>;

/// 服务实例：各注册表的属主
pub struct HiveService {
    config: AppConfig,
    gateway: Arc<LlmGateway>,
    tools: Arc<ToolRegistry>,
    skills: Arc<SkillRegistry>,
    gate: Arc<ApprovalGate>,
    workers: Arc<WorkerRegistry>,
    templates: Arc<TemplateRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    worker_stack: WorkerStackFn,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HiveService {
    /// 装配服务；加载技能与模板，注册内置工具，发现桥接工具
    pub async fn new(
        config: AppConfig,
        gateway: Arc<LlmGateway>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let skills = Arc::new(SkillRegistry::new(&config.skills.prompts_dir));
        let loaded = skills.load_all().await;
        tracing::info!(skill_count = loaded, "skills_loaded");

        let creator = Arc::new(SkillCreator::new(Arc::clone(&gateway)));
        let tools = Arc::new(ToolRegistry::new(30));
        tools
            .register(Arc::new(LoadSkillTool::new(Arc::clone(&skills))))
            .await;
        tools
            .register(Arc::new(CreateSkillTool::new(
                Arc::clone(&skills),
                Arc::clone(&creator),
            )))
            .await;
        tools
            .register(Arc::new(UpdateSkillTool::new(
                Arc::clone(&skills),
                Arc::clone(&creator),
            )))
            .await;
        tools
            .register(Arc::new(ListSkillsTool::new(Arc::clone(&skills))))
            .await;

        let gate = Arc::new(ApprovalGate::new(Duration::from_secs(
            config.approval.ttl_seconds,
        )));
        let workers = Arc::new(WorkerRegistry::from_entries(&config.workers));
        let templates = Arc::new(TemplateRegistry::load_dir(&config.workflow.templates_path));

        // 工作者栈：自有指令 + 探针 + 审批；压缩与角色过滤只在主栈
        let worker_stack: WorkerStackFn = {
            let skills = Arc::clone(&skills);
            let gate = Arc::clone(&gate);
            let patterns = config.approval.sensitive_patterns.clone();
            Arc::new(move |worker: &WorkerConfig| {
                MiddlewareStack::new()
                    .with(Arc::new(
                        DirectiveMiddleware::new(Arc::clone(&skills))
                            .with_template(worker.system_directive.clone()),
                    ))
                    .with(Arc::new(ObservabilityMiddleware))
                    .with(Arc::new(MetricsMiddleware))
                    .with(Arc::new(ApprovalMiddleware::new(
                        Arc::clone(&gate),
                        patterns.clone(),
                    )))
            })
        };

        let service = Self {
            config,
            gateway,
            tools,
            skills,
            gate,
            workers,
            templates,
            checkpoints,
            worker_stack,
            session_locks: Mutex::new(HashMap::new()),
        };
        service.refresh_external_tools().await;
        service
    }

    /// 注册知识检索工具（实现由外部提供）
    pub async fn with_knowledge_retriever(self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.tools
            .register(Arc::new(RetrieveKnowledgeTool::new(retriever)))
            .await;
        self
    }

    /// 周期清扫过期审批；返回句柄供停机
    pub fn start_approval_sweeper(&self) -> tokio::task::JoinHandle<()> {
        spawn_sweeper(
            Arc::clone(&self.gate),
            Duration::from_secs(self.config.approval.sweep_interval_seconds),
        )
    }

    pub fn approval_gate(&self) -> Arc<ApprovalGate> {
        Arc::clone(&self.gate)
    }

    pub fn tool_registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.tools)
    }

    pub fn skill_registry(&self) -> Arc<SkillRegistry> {
        Arc::clone(&self.skills)
    }

    pub fn worker_registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.workers)
    }

    /// 主模式（single）中间件栈：指令 -> 压缩 -> 角色过滤 -> 探针 -> 指标 -> 审批
    fn default_stack(&self) -> MiddlewareStack {
        MiddlewareStack::new()
            .with(Arc::new(DirectiveMiddleware::new(Arc::clone(&self.skills))))
            .with(Arc::new(CompactionMiddleware::new(
                Arc::clone(&self.gateway),
                self.config.summarization.trigger_tokens,
                self.config.summarization.keep_messages,
                self.config.summarization.model.clone(),
            )))
            .with(Arc::new(RoleFilterMiddleware::new()))
            .with(Arc::new(ObservabilityMiddleware))
            .with(Arc::new(MetricsMiddleware))
            .with(Arc::new(ApprovalMiddleware::new(
                Arc::clone(&self.gate),
                self.config.approval.sensitive_patterns.clone(),
            )))
    }

    fn supervisor_stack(&self) -> MiddlewareStack {
        MiddlewareStack::new()
            .with(Arc::new(ObservabilityMiddleware))
            .with(Arc::new(MetricsMiddleware))
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        Arc::clone(
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn request_context(&self, req: &ExecuteRequest) -> RequestContext {
        let mut ctx = RequestContext::new(req.session_id.clone())
            .with_role(req.role.clone())
            .with_budget(Duration::from_secs(
                self.config.agent.per_request_budget_seconds,
            ));
        if let Some(user_id) = &req.user_id {
            ctx = ctx.with_user(user_id.clone());
        }
        ctx
    }

    /// 执行请求；events 可选（流式消费方收 Token/事件序列）
    pub async fn execute(
        &self,
        req: ExecuteRequest,
        events: Option<&EventSender>,
    ) -> Result<AgentState, AgentError> {
        Metrics::global()
            .requests
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::info!(
            session_id = %req.session_id,
            mode = ?req.mode,
            message_count = req.messages.len(),
            "chat_request_received"
        );

        // 同会话串行
        let lock = self.session_lock(&req.session_id).await;
        let _guard = lock.lock().await;

        let ctx = self.request_context(&req);
        let state = match req.mode {
            ExecutionMode::Single => {
                let driver = AgentDriver::new(
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.tools),
                    self.default_stack(),
                    Arc::clone(&self.checkpoints),
                )
                .with_cycle_cap(self.config.agent.cycle_cap);
                driver.run(req.messages, &ctx, events).await?.into_state()
            }
            ExecutionMode::Multi => {
                let router = MultiAgentRouter::new(
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.tools),
                    Arc::clone(&self.checkpoints),
                    Arc::clone(&self.workers),
                    self.supervisor_stack(),
                    Arc::clone(&self.worker_stack),
                )
                .with_cycle_cap(self.config.agent.cycle_cap);
                router.run(req.messages, &ctx, events).await?
            }
            ExecutionMode::Workflow => {
                let planner = WorkflowPlanner::new(
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.templates),
                    Arc::clone(&self.workers),
                );
                let runner = Arc::new(DriverWorkerRunner::new(
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.tools),
                    Arc::clone(&self.worker_stack),
                    self.config.agent.cycle_cap,
                ));
                let scheduler = WorkflowScheduler::new(
                    planner,
                    Arc::clone(&self.workers),
                    runner,
                    Arc::clone(&self.checkpoints),
                );
                let workflow_state = scheduler
                    .run(req.messages, &ctx, req.template.as_deref(), events)
                    .await?;

                let mut state = AgentState::default();
                state.metadata.session_id = req.session_id.clone();
                state.metadata.user_id = req.user_id.clone();
                state.metadata.user_role = req.role.clone();
                state.messages = workflow_state.messages;
                state
            }
        };

        let final_text = state
            .last_assistant()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        emit_chunks_and_done(&events, &final_text);
        Ok(state)
    }

    /// 流式执行：返回事件接收端；任务在后台完成
    pub fn execute_stream(
        self: Arc<Self>,
        req: ExecuteRequest,
    ) -> (EventReceiver, tokio::task::JoinHandle<Result<AgentState, AgentError>>) {
        let (tx, rx) = crate::agent::channel();
        let handle = tokio::spawn(async move { self.execute(req, Some(&tx)).await });
        (rx, handle)
    }

    /// 会话内待审批列表（顺带清扫过期）
    pub async fn list_pending_approvals(&self, session_id: &str) -> Vec<ApprovalRequest> {
        self.gate.list_pending(Some(session_id)).await
    }

    pub async fn approve(
        &self,
        session_id: &str,
        request_id: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, AgentError> {
        self.gate.approve(session_id, request_id, comment).await
    }

    pub async fn reject(
        &self,
        session_id: &str,
        request_id: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalRequest, AgentError> {
        self.gate.reject(session_id, request_id, comment).await
    }

    /// (name, description) 模板列表
    pub fn list_workflow_templates(&self) -> Vec<(String, String)> {
        self.templates.list()
    }

    /// 运行时注册工作者（Supervisor 指令与 handoff 工具集随之重建）
    pub async fn register_worker(&self, name: &str, system_directive: &str, description: &str) {
        self.workers
            .register_worker(name, system_directive, description)
            .await;
    }

    /// 重新发现外部桥接工具；返回注册数。进行中的请求不受阻塞。
    pub async fn refresh_external_tools(&self) -> usize {
        let configs = load_bridge_configs(&self.config.bridge.config_path);
        let mut total = 0;
        for config in &configs {
            let bridge = Arc::new(HttpToolBridge::new(config));
            total += discover(&self.tools, bridge).await;
        }
        if !configs.is_empty() {
            tracing::info!(bridges = configs.len(), tools_count = total, "external_tools_refreshed");
        }
        total
    }

    /// 显式移除会话：删除其全部检查点
    pub async fn remove_session(&self, session_id: &str) -> Result<(), AgentError> {
        self.checkpoints
            .delete_thread(session_id)
            .await
            .map_err(|e| AgentError::CheckpointUnavailable(e.to_string()))
    }
}
