//! 多智能体路由
//!
//! Supervisor 的工具集只有一组 handoff 描述符（transfer_to_<worker>）。它产出回复后，
//! 驱动器把第一个 handoff 转为 Goto；路由器将控制权交给对应工作者（带完整工具集与
//! 自己的系统指令），工作者直接产出最终回复，本轮不回到 Supervisor。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::agent::{send_event, AgentDriver, AgentEvent, DriverOutcome, EventSender};
use crate::checkpoint::{restore_state, CheckpointStore};
use crate::config::WorkerEntry;
use crate::core::{AgentError, AgentState, Message, RequestContext, Role};
use crate::llm::LlmGateway;
use crate::middleware::{Middleware, MiddlewareStack};
use crate::tools::ToolRegistry;

/// 多智能体模式的检查点命名空间（Supervisor 与工作者共享同一线程历史）
pub const MULTI_NAMESPACE: &str = "multi";

/// 工作者配置
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub name: String,
    /// 供 Supervisor 路由决策的描述
    pub description: String,
    pub system_directive: String,
}

/// 工作者注册表；运行时可增改，Supervisor 指令与 handoff 工具集按次重建
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerConfig>>,
}

impl WorkerRegistry {
    pub fn new(workers: Vec<WorkerConfig>) -> Self {
        Self {
            workers: RwLock::new(workers),
        }
    }

    /// 内置默认目录：researcher / coder / analyst
    pub fn with_defaults() -> Self {
        Self::new(vec![
            WorkerConfig {
                name: "researcher".to_string(),
                description: "Specializes in web search, information gathering, fact-checking, and summarizing findings.".to_string(),
                system_directive: "You are an expert researcher. Your strengths:\n\
                    - Thorough information gathering and fact-checking\n\
                    - Summarizing complex findings clearly\n\
                    - Providing well-structured research reports\n\n\
                    Always cite sources when possible. Present findings in a clear, organized format.".to_string(),
            },
            WorkerConfig {
                name: "coder".to_string(),
                description: "Specializes in writing code, debugging, code review, and technical architecture.".to_string(),
                system_directive: "You are an expert software engineer. Your strengths:\n\
                    - Writing clean, production-ready code\n\
                    - Debugging and troubleshooting\n\
                    - Code review with security and performance focus\n\n\
                    Always follow best practices. Include error handling. Explain your code decisions.".to_string(),
            },
            WorkerConfig {
                name: "analyst".to_string(),
                description: "Specializes in data analysis, statistics, visualization recommendations, and business insights.".to_string(),
                system_directive: "You are an expert data analyst. Your strengths:\n\
                    - Statistical analysis and interpretation\n\
                    - Business intelligence and insights\n\
                    - Clear presentation of quantitative findings\n\n\
                    Always explain your methodology. Present results with context and actionable recommendations.".to_string(),
            },
        ])
    }

    /// 从配置装载；为空时退回默认目录
    pub fn from_entries(entries: &[WorkerEntry]) -> Self {
        if entries.is_empty() {
            return Self::with_defaults();
        }
        Self::new(
            entries
                .iter()
                .map(|e| WorkerConfig {
                    name: e.name.clone(),
                    description: e.description.clone(),
                    system_directive: e.system_directive.clone(),
                })
                .collect(),
        )
    }

    /// 注册或替换工作者
    pub async fn register_worker(&self, name: &str, system_directive: &str, description: &str) {
        let mut workers = self.workers.write().await;
        let config = WorkerConfig {
            name: name.to_string(),
            description: description.to_string(),
            system_directive: system_directive.to_string(),
        };
        match workers.iter_mut().find(|w| w.name == name) {
            Some(existing) => *existing = config,
            None => workers.push(config),
        }
        tracing::info!(worker = %name, "worker_registered");
    }

    pub async fn get(&self, name: &str) -> Option<WorkerConfig> {
        self.workers
            .read()
            .await
            .iter()
            .find(|w| w.name == name)
            .cloned()
    }

    pub async fn list(&self) -> Vec<WorkerConfig> {
        self.workers.read().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| w.name.clone())
            .collect()
    }

    /// handoff 工具名 -> 工作者名
    pub async fn handoff_table(&self) -> HashMap<String, String> {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| (format!("transfer_to_{}", w.name), w.name.clone()))
            .collect()
    }

    /// Supervisor 系统指令：枚举工作者及其描述
    pub async fn supervisor_directive(&self) -> String {
        let workers = self.workers.read().await;
        let catalog = workers
            .iter()
            .map(|w| format!("- **{}**: {}", w.name, w.description))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are a Supervisor agent. Analyze the user's request and route it to the most \
             appropriate specialist worker.\n\n## Available Workers\n{}\n\n## Instructions\n\
             1. If the request matches a worker's specialty, call the corresponding transfer tool \
             (e.g. transfer_to_researcher).\n\
             2. If it's a general conversation, respond directly without delegating.\n\
             3. Delegate to at most one worker.",
            catalog
        )
    }
}

/// 固定文本指令中间件（Supervisor 指令按次渲染）
struct StaticDirective {
    text: String,
}

#[async_trait]
impl Middleware for StaticDirective {
    fn name(&self) -> &str {
        "static_directive"
    }

    async fn before_model(
        &self,
        state: &mut AgentState,
        _ctx: &RequestContext,
    ) -> Result<(), AgentError> {
        if state
            .messages
            .first()
            .map(|m| m.role == Role::SystemDirective)
            .unwrap_or(false)
        {
            state.messages[0] = Message::directive(self.text.clone());
        } else {
            state.messages.insert(0, Message::directive(self.text.clone()));
        }
        Ok(())
    }
}

/// 路由器：Supervisor + 命名工作者集合
pub struct MultiAgentRouter {
    gateway: Arc<LlmGateway>,
    registry: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    workers: Arc<WorkerRegistry>,
    /// Supervisor 的探针类中间件（指令由路由器按次注入在最前）
    supervisor_stack: MiddlewareStack,
    /// 每个工作者的栈构造（含该工作者的系统指令）
    worker_stack: Arc<dyn Fn(&WorkerConfig) -> MiddlewareStack + Send + Sync>,
    cycle_cap: usize,
}

impl MultiAgentRouter {
    pub fn new(
        gateway: Arc<LlmGateway>,
        registry: Arc<ToolRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        workers: Arc<WorkerRegistry>,
        supervisor_stack: MiddlewareStack,
        worker_stack: Arc<dyn Fn(&WorkerConfig) -> MiddlewareStack + Send + Sync>,
    ) -> Self {
        Self {
            gateway,
            registry,
            checkpoints,
            workers,
            supervisor_stack,
            worker_stack,
            cycle_cap: 25,
        }
    }

    pub fn with_cycle_cap(mut self, cap: usize) -> Self {
        self.cycle_cap = cap.max(1);
        self
    }

    /// 执行一轮多智能体请求
    pub async fn run(
        &self,
        incoming: Vec<Message>,
        ctx: &RequestContext,
        events: Option<&EventSender>,
    ) -> Result<AgentState, AgentError> {
        let mut stack = MiddlewareStack::new().with(Arc::new(StaticDirective {
            text: self.workers.supervisor_directive().await,
        }));
        stack.extend(&self.supervisor_stack);

        // Supervisor 不暴露普通工具，只有 handoff 描述符
        let supervisor = AgentDriver::new(
            Arc::clone(&self.gateway),
            Arc::new(ToolRegistry::new(1)),
            stack,
            Arc::clone(&self.checkpoints),
        )
        .with_namespace(MULTI_NAMESPACE)
        .with_cycle_cap(self.cycle_cap)
        .with_handoffs(self.workers.handoff_table().await);

        let outcome = supervisor.run(incoming, ctx, events).await?;

        let worker_name = match outcome {
            // 无 handoff：Supervisor 的回复即最终回答
            DriverOutcome::Final(state) => return Ok(state),
            DriverOutcome::Handoff { worker, .. } => worker,
        };

        let Some(config) = self.workers.get(&worker_name).await else {
            return self.unknown_worker(&worker_name, ctx, events).await;
        };

        // 工作者：完整（非 handoff）工具集 + 自己的指令栈；从共享检查点续跑
        let worker = AgentDriver::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.registry),
            (self.worker_stack)(&config),
            Arc::clone(&self.checkpoints),
        )
        .with_namespace(MULTI_NAMESPACE)
        .with_cycle_cap(self.cycle_cap);

        tracing::info!(worker = %config.name, session_id = %ctx.session_id, "worker_started");
        let outcome = worker.run(Vec::new(), ctx, events).await?;
        tracing::info!(worker = %config.name, "worker_completed");
        Ok(outcome.into_state())
    }

    /// handoff 指向未注册工作者：错误落回线程历史
    async fn unknown_worker(
        &self,
        worker_name: &str,
        ctx: &RequestContext,
        events: Option<&EventSender>,
    ) -> Result<AgentState, AgentError> {
        tracing::warn!(worker = %worker_name, "worker_not_found");
        let notice = format!(
            "Error: worker '{}' is not registered; the request cannot be delegated.",
            worker_name
        );
        send_event(&events, AgentEvent::Error { text: notice.clone() });

        let mut state = match self
            .checkpoints
            .get_latest(&ctx.session_id, MULTI_NAMESPACE)
            .await
        {
            Ok(Some(checkpoint)) => {
                restore_state(&checkpoint.channel_values).unwrap_or_default()
            }
            _ => AgentState::default(),
        };
        state.append(Message::assistant(notice));
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::LlmSection;
    use crate::core::ToolCall;
    use crate::llm::{LlmReply, ScriptedLlm};

    fn plain_worker_stack() -> Arc<dyn Fn(&WorkerConfig) -> MiddlewareStack + Send + Sync> {
        Arc::new(|_config: &WorkerConfig| MiddlewareStack::new())
    }

    fn router_with(replies: Vec<LlmReply>) -> MultiAgentRouter {
        let llm = Arc::new(ScriptedLlm::new(replies));
        let gateway = Arc::new(LlmGateway::single(llm, &LlmSection::default()));
        MultiAgentRouter::new(
            gateway,
            Arc::new(ToolRegistry::new(5)),
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(WorkerRegistry::with_defaults()),
            MiddlewareStack::new(),
            plain_worker_stack(),
        )
    }

    #[tokio::test]
    async fn test_handoff_routes_to_worker() {
        // 第一条：Supervisor 发 handoff；第二条：coder 工作者的回复
        let router = router_with(vec![
            LlmReply::text("").with_tool_calls(vec![ToolCall::new(
                "transfer_to_coder",
                serde_json::json!({"request": "write fib"}),
            )]),
            LlmReply::text("def fib(n): ..."),
        ]);

        let (tx, mut rx) = crate::agent::channel();
        let ctx = RequestContext::new("s1");
        let state = router
            .run(vec![Message::user("Write fib in Python")], &ctx, Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(state.last_assistant().unwrap().content, "def fib(n): ...");

        let mut handoffs = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let AgentEvent::Handoff { worker } = ev {
                handoffs.push(worker);
            }
        }
        assert_eq!(handoffs, vec!["coder".to_string()]);
    }

    #[tokio::test]
    async fn test_no_handoff_supervisor_answers() {
        let router = router_with(vec![LlmReply::text("Hello! How can I help?")]);
        let ctx = RequestContext::new("s1");
        let state = router
            .run(vec![Message::user("hi")], &ctx, None)
            .await
            .unwrap();
        assert_eq!(state.last_assistant().unwrap().content, "Hello! How can I help?");
    }

    #[tokio::test]
    async fn test_first_of_multiple_handoffs_wins() {
        let router = router_with(vec![
            LlmReply::text("").with_tool_calls(vec![
                ToolCall::new("transfer_to_researcher", serde_json::json!({"request": "a"})),
                ToolCall::new("transfer_to_coder", serde_json::json!({"request": "b"})),
            ]),
            LlmReply::text("research notes"),
        ]);
        let ctx = RequestContext::new("s1");
        let state = router
            .run(vec![Message::user("do both")], &ctx, None)
            .await
            .unwrap();
        assert_eq!(state.last_assistant().unwrap().content, "research notes");
    }

    #[tokio::test]
    async fn test_register_worker_extends_handoffs() {
        let registry = WorkerRegistry::with_defaults();
        registry
            .register_worker("translator", "You translate text.", "Translates between languages.")
            .await;

        let table = registry.handoff_table().await;
        assert!(table.contains_key("transfer_to_translator"));
        let directive = registry.supervisor_directive().await;
        assert!(directive.contains("translator"));

        // 重复注册覆盖
        registry
            .register_worker("translator", "v2", "Updated description.")
            .await;
        assert_eq!(registry.get("translator").await.unwrap().system_directive, "v2");
        assert_eq!(registry.list().await.len(), 4);
    }
}
