//! Agent 循环驱动器
//!
//! 推理 -> 工具 -> 推理，直到回复不含工具调用。每个循环：全部 before_model ->
//! 角色过滤后的工具集 -> wrap_model_call 链 -> 追加回复 -> 全部 after_model ->
//! 逐个工具调用走 wrap_tool_call 链（Result 落为 tool_result；Goto 交给路由器）。
//! 每循环结束持久化一个检查点；取消时返回最近一次已提交循环的状态。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::events::{preview, send_event, AgentEvent, EventSender};
use crate::checkpoint::{restore_state, snapshot_state, Checkpoint, CheckpointStore, PendingWrite};
use crate::core::{AgentError, AgentState, Message, RequestContext, ToolCall};
use crate::llm::{LlmGateway, LlmReply};
use crate::middleware::{
    MiddlewareStack, ModelRequest, ModelTerminal, ToolCallRequest, ToolDispatch, ToolTerminal,
};
use crate::tools::ToolRegistry;

/// 默认检查点命名空间
pub const AGENT_NAMESPACE: &str = "agent";

/// 循环终点：最终状态，或移交给指定工作者
#[derive(Debug)]
pub enum DriverOutcome {
    Final(AgentState),
    Handoff { state: AgentState, worker: String },
}

impl DriverOutcome {
    pub fn state(&self) -> &AgentState {
        match self {
            DriverOutcome::Final(s) => s,
            DriverOutcome::Handoff { state, .. } => state,
        }
    }

    pub fn into_state(self) -> AgentState {
        match self {
            DriverOutcome::Final(s) => s,
            DriverOutcome::Handoff { state, .. } => state,
        }
    }
}

/// 模型链终端：LLM 网关
struct GatewayTerminal {
    gateway: Arc<LlmGateway>,
    ctx: RequestContext,
}

#[async_trait]
impl ModelTerminal for GatewayTerminal {
    async fn call(&self, req: ModelRequest) -> Result<LlmReply, AgentError> {
        self.gateway.call(&req.messages, &req.tools, &self.ctx).await
    }
}

/// 工具链终端：handoff 判定 + 注册表执行；执行失败转 "Error: ..." 结果
struct ExecTerminal {
    registry: Arc<ToolRegistry>,
    handoffs: HashMap<String, String>,
}

#[async_trait]
impl ToolTerminal for ExecTerminal {
    async fn call(&self, req: ToolCallRequest) -> Result<ToolDispatch, AgentError> {
        // handoff 工具是声明性描述符，从不作为普通工具执行
        if let Some(worker) = self.handoffs.get(&req.call.name) {
            return Ok(ToolDispatch::Goto(worker.clone()));
        }

        match self
            .registry
            .execute(&req.call.name, &req.user_role, req.call.arguments.clone())
            .await
        {
            Ok(output) => Ok(ToolDispatch::Result(output)),
            Err(e) => Ok(ToolDispatch::Result(format!("Error: {}", e))),
        }
    }
}

/// 循环驱动器
pub struct AgentDriver {
    gateway: Arc<LlmGateway>,
    registry: Arc<ToolRegistry>,
    stack: MiddlewareStack,
    checkpoints: Arc<dyn CheckpointStore>,
    namespace: String,
    /// handoff 工具名 -> 工作者名（仅 Supervisor 驱动器非空）
    handoffs: HashMap<String, String>,
    cycle_cap: usize,
}

impl AgentDriver {
    pub fn new(
        gateway: Arc<LlmGateway>,
        registry: Arc<ToolRegistry>,
        stack: MiddlewareStack,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            gateway,
            registry,
            stack,
            checkpoints,
            namespace: AGENT_NAMESPACE.to_string(),
            handoffs: HashMap::new(),
            cycle_cap: 25,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_cycle_cap(mut self, cap: usize) -> Self {
        self.cycle_cap = cap.max(1);
        self
    }

    pub fn with_handoffs(mut self, handoffs: HashMap<String, String>) -> Self {
        self.handoffs = handoffs;
        self
    }

    /// 加载最近检查点并合并新消息；读失败按全新会话处理
    async fn load_state(
        &self,
        ctx: &RequestContext,
        incoming: &[Message],
    ) -> (AgentState, Option<String>) {
        let (mut state, parent) = match self
            .checkpoints
            .get_latest(&ctx.session_id, &self.namespace)
            .await
        {
            Ok(Some(checkpoint)) => match restore_state(&checkpoint.channel_values) {
                Ok(state) => (state, Some(checkpoint.checkpoint_id)),
                Err(e) => {
                    tracing::warn!(error = %e, "checkpoint_restore_failed");
                    (AgentState::default(), None)
                }
            },
            Ok(None) => (AgentState::default(), None),
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint_load_failed");
                (AgentState::default(), None)
            }
        };

        state.metadata.session_id = ctx.session_id.clone();
        state.metadata.user_id = ctx.user_id.clone();
        state.metadata.user_role = ctx.user_role.clone();
        state.extend(incoming.iter().cloned());
        (state, parent)
    }

    /// 持久化一个循环：检查点 + 本循环新增消息作为通道写入
    async fn commit_cycle(
        &self,
        ctx: &RequestContext,
        state: &AgentState,
        parent: &mut Option<String>,
        committed_len: usize,
        cycle: usize,
    ) -> Result<(), AgentError> {
        let writes: Vec<PendingWrite> = state.messages[committed_len..]
            .iter()
            .enumerate()
            .map(|(i, m)| PendingWrite {
                task_id: format!("cycle-{}", cycle),
                idx: i as i64,
                channel: "messages".to_string(),
                value: serde_json::to_value(m).unwrap_or(serde_json::Value::Null),
            })
            .collect();

        let checkpoint = Checkpoint::new(
            ctx.session_id.clone(),
            self.namespace.clone(),
            parent.clone(),
            snapshot_state(state),
        );
        let id = checkpoint.checkpoint_id.clone();

        self.checkpoints
            .put(checkpoint, writes)
            .await
            .map_err(|e| AgentError::CheckpointUnavailable(e.to_string()))?;
        *parent = Some(id);
        Ok(())
    }

    /// 执行循环直至终止；events 可选（流式消费方）
    pub async fn run(
        &self,
        incoming: Vec<Message>,
        ctx: &RequestContext,
        events: Option<&EventSender>,
    ) -> Result<DriverOutcome, AgentError> {
        let (mut state, mut parent) = self.load_state(ctx, &incoming).await;
        // 已提交状态：取消时回到这里
        let mut committed = state.clone();
        let mut committed_len = state.messages.len();

        let model_terminal = GatewayTerminal {
            gateway: Arc::clone(&self.gateway),
            ctx: ctx.clone(),
        };
        let tool_terminal = ExecTerminal {
            registry: Arc::clone(&self.registry),
            handoffs: self.handoffs.clone(),
        };

        let mut cycle = 0;
        loop {
            if ctx.is_cancelled() {
                tracing::info!(session_id = %ctx.session_id, cycle, "run_cancelled");
                return Ok(DriverOutcome::Final(committed));
            }

            if cycle >= self.cycle_cap {
                let notice = format!(
                    "Error: cycle cap exceeded after {} cycles; aborting this request.",
                    self.cycle_cap
                );
                send_event(&events, AgentEvent::Error { text: notice.clone() });
                tracing::warn!(session_id = %ctx.session_id, cap = self.cycle_cap, "cycle_cap_exceeded");
                state.append(Message::assistant(notice));
                self.commit_cycle(ctx, &state, &mut parent, committed_len, cycle)
                    .await?;
                return Ok(DriverOutcome::Final(state));
            }

            send_event(&events, AgentEvent::CycleStarted { cycle, cap: self.cycle_cap });

            match self.stack.before_model(&mut state, ctx).await {
                Ok(()) => {}
                Err(AgentError::Cancelled) => return Ok(DriverOutcome::Final(committed)),
                Err(e) => return Err(e),
            }

            let tools = self.registry.specs(&ctx.user_role).await;
            let mut request = ModelRequest {
                messages: state.messages.clone(),
                tools,
                model: self.gateway.default_model().to_string(),
            };
            // Supervisor 把 handoff 描述符并入工具集
            if !self.handoffs.is_empty() {
                request.tools.extend(
                    self.handoffs
                        .keys()
                        .map(|name| handoff_spec(name)),
                );
            }

            let reply = match self.stack.model_call(request, ctx, &model_terminal).await {
                Ok(r) => r,
                Err(AgentError::Cancelled) => return Ok(DriverOutcome::Final(committed)),
                Err(e) => {
                    send_event(&events, AgentEvent::Error { text: e.to_string() });
                    return Err(e);
                }
            };

            let assistant =
                Message::assistant_with_calls(reply.text.clone(), reply.tool_calls.clone());
            state.append(assistant);
            send_event(
                &events,
                AgentEvent::AssistantMessage {
                    content: reply.text.clone(),
                    tool_calls: reply.tool_calls.len(),
                },
            );

            match self.stack.after_model(&mut state, ctx).await {
                Ok(()) => {}
                Err(AgentError::Cancelled) => return Ok(DriverOutcome::Final(committed)),
                Err(e) => return Err(e),
            }

            if reply.tool_calls.is_empty() {
                self.commit_cycle(ctx, &state, &mut parent, committed_len, cycle)
                    .await?;
                return Ok(DriverOutcome::Final(state));
            }

            let mut goto: Option<String> = None;
            for call in &reply.tool_calls {
                if ctx.is_cancelled() {
                    return Ok(DriverOutcome::Final(committed));
                }

                send_event(
                    &events,
                    AgentEvent::ToolCallStarted {
                        tool: call.name.clone(),
                        args: call.arguments.clone(),
                    },
                );

                let dispatch = self
                    .dispatch_tool_call(call, ctx, &tool_terminal)
                    .await;

                match dispatch {
                    Ok(ToolDispatch::Result(output)) => {
                        send_event(
                            &events,
                            AgentEvent::ToolResult {
                                tool: call.name.clone(),
                                preview: preview(&output),
                            },
                        );
                        state.append(Message::tool_result(call.id.clone(), output));
                    }
                    Ok(ToolDispatch::Goto(worker)) => {
                        // 第一个 handoff 生效，其余调用不再派发
                        send_event(&events, AgentEvent::Handoff { worker: worker.clone() });
                        goto = Some(worker);
                        break;
                    }
                    Err(AgentError::Cancelled) => return Ok(DriverOutcome::Final(committed)),
                    Err(e) => {
                        // 工具层错误转为 Error: 前缀结果，模型下轮可自行恢复
                        send_event(&events, AgentEvent::Error { text: e.to_string() });
                        state.append(Message::tool_result(
                            call.id.clone(),
                            format!("Error: {}", e),
                        ));
                    }
                }
            }

            self.commit_cycle(ctx, &state, &mut parent, committed_len, cycle)
                .await?;
            committed = state.clone();
            committed_len = state.messages.len();

            if let Some(worker) = goto {
                return Ok(DriverOutcome::Handoff { state, worker });
            }

            cycle += 1;
        }
    }

    async fn dispatch_tool_call(
        &self,
        call: &ToolCall,
        ctx: &RequestContext,
        terminal: &ExecTerminal,
    ) -> Result<ToolDispatch, AgentError> {
        let request = ToolCallRequest {
            call: call.clone(),
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            user_role: ctx.user_role.clone(),
        };
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
            r = self.stack.tool_call(request, ctx, terminal) => r,
        }
    }
}

/// handoff 工具的声明性描述符
pub fn handoff_spec(name: &str) -> crate::llm::ToolSpec {
    let worker = name.strip_prefix("transfer_to_").unwrap_or(name);
    crate::llm::ToolSpec::new(
        name,
        format!("Transfer the request to the {} specialist", worker),
    )
    .with_parameters(serde_json::json!({
        "type": "object",
        "properties": {
            "request": {"type": "string", "description": "What the specialist should do"}
        },
        "required": ["request"]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::LlmSection;
    use crate::llm::{LlmReply, ScriptedLlm};
    use crate::tools::Tool;
    use serde_json::Value;

    struct StaticSearch;

    #[async_trait]
    impl Tool for StaticSearch {
        fn name(&self) -> &str {
            "web_search"
        }
        fn description(&self) -> &str {
            "Search the web"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok("doc: X".to_string())
        }
    }

    async fn driver_with(
        replies: Vec<LlmReply>,
        store: Arc<MemoryCheckpointStore>,
    ) -> AgentDriver {
        let llm = Arc::new(ScriptedLlm::new(replies));
        let gateway = Arc::new(LlmGateway::single(llm, &LlmSection::default()));
        let registry = Arc::new(ToolRegistry::new(5));
        registry.register(Arc::new(StaticSearch)).await;
        AgentDriver::new(gateway, registry, MiddlewareStack::new(), store)
    }

    #[tokio::test]
    async fn test_no_tool_reply_terminates_in_one_cycle() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let driver = driver_with(vec![LlmReply::text("plain answer")], Arc::clone(&store)).await;
        let ctx = RequestContext::new("s1");

        let outcome = driver
            .run(vec![Message::user("hi")], &ctx, None)
            .await
            .unwrap();
        let state = outcome.into_state();

        assert_eq!(state.last_assistant().unwrap().content, "plain answer");
        assert_eq!(store.count("s1", "agent").await, 1);
    }

    #[tokio::test]
    async fn test_tool_cycle_then_final() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let call = ToolCall::new("web_search", serde_json::json!({"q": "X"}));
        let driver = driver_with(
            vec![
                LlmReply::text("").with_tool_calls(vec![call]),
                LlmReply::text("Found: doc: X"),
            ],
            Arc::clone(&store),
        )
        .await;
        let ctx = RequestContext::new("s1");

        let state = driver
            .run(vec![Message::user("Search X")], &ctx, None)
            .await
            .unwrap()
            .into_state();

        assert_eq!(state.last_assistant().unwrap().content, "Found: doc: X");
        let tool_results: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.role == crate::core::Role::ToolResult)
            .collect();
        assert_eq!(tool_results.len(), 1);
        assert_eq!(tool_results[0].content, "doc: X");
        // 两个循环 -> 两个检查点
        assert_eq!(store.count("s1", "agent").await, 2);
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let call = ToolCall::new("no_such_tool", serde_json::json!({}));
        let driver = driver_with(
            vec![
                LlmReply::text("").with_tool_calls(vec![call]),
                LlmReply::text("sorry"),
            ],
            Arc::clone(&store),
        )
        .await;
        let ctx = RequestContext::new("s1");

        let state = driver
            .run(vec![Message::user("go")], &ctx, None)
            .await
            .unwrap()
            .into_state();

        let err_result = state
            .messages
            .iter()
            .find(|m| m.role == crate::core::Role::ToolResult)
            .unwrap();
        assert!(err_result.content.starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_cycle_cap_surfaces_in_final_state() {
        let store = Arc::new(MemoryCheckpointStore::new());
        // 每轮都要求工具调用，永不收敛
        let replies: Vec<LlmReply> = (0..10)
            .map(|_| {
                LlmReply::text("")
                    .with_tool_calls(vec![ToolCall::new("web_search", serde_json::json!({}))])
            })
            .collect();
        let driver = driver_with(replies, Arc::clone(&store)).await.with_cycle_cap(3);
        let ctx = RequestContext::new("s1");

        let state = driver
            .run(vec![Message::user("loop")], &ctx, None)
            .await
            .unwrap()
            .into_state();

        let last = state.last_assistant().unwrap();
        assert!(last.content.contains("cycle cap exceeded"));
    }

    #[tokio::test]
    async fn test_resume_extends_history_monotonically() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let driver = driver_with(vec![LlmReply::text("one")], Arc::clone(&store)).await;
        let ctx = RequestContext::new("s1");
        let first = driver
            .run(vec![Message::user("a")], &ctx, None)
            .await
            .unwrap()
            .into_state();

        let driver = driver_with(vec![LlmReply::text("two")], Arc::clone(&store)).await;
        let second = driver
            .run(vec![Message::user("b")], &ctx, None)
            .await
            .unwrap()
            .into_state();

        // 前缀保持（单调历史）
        assert!(second.messages.len() > first.messages.len());
        for (before, after) in first.messages.iter().zip(second.messages.iter()) {
            assert_eq!(before.id, after.id);
        }
        // 检查点父链
        let chain = store.list("s1", "agent").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain[1].parent_checkpoint_id.as_deref(),
            Some(chain[0].checkpoint_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_handoff_outcome() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let call = ToolCall::new("transfer_to_coder", serde_json::json!({"request": "write fib"}));
        let llm = Arc::new(ScriptedLlm::new(vec![
            LlmReply::text("").with_tool_calls(vec![call]),
        ]));
        let gateway = Arc::new(LlmGateway::single(llm, &LlmSection::default()));
        let registry = Arc::new(ToolRegistry::new(5));
        let driver = AgentDriver::new(gateway, registry, MiddlewareStack::new(), store)
            .with_handoffs(HashMap::from([(
                "transfer_to_coder".to_string(),
                "coder".to_string(),
            )]));

        let ctx = RequestContext::new("s1");
        let outcome = driver
            .run(vec![Message::user("Write fib")], &ctx, None)
            .await
            .unwrap();

        match outcome {
            DriverOutcome::Handoff { worker, .. } => assert_eq!(worker, "coder"),
            DriverOutcome::Final(_) => panic!("expected handoff"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_returns_committed_state() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let driver = driver_with(vec![LlmReply::text("never")], Arc::clone(&store)).await;
        let ctx = RequestContext::new("s1");
        ctx.cancel.cancel();

        let state = driver
            .run(vec![Message::user("hi")], &ctx, None)
            .await
            .unwrap()
            .into_state();

        // 取消发生在第一个循环前：无 assistant 输出，无检查点
        assert!(state.last_assistant().is_none());
        assert_eq!(store.count("s1", "agent").await, 0);
    }
}
