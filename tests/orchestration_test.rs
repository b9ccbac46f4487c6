//! 编排核心集成测试：单智能体、多智能体路由、工作流与审批门

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use hive::agent::AgentEvent;
use hive::approval::ApprovalStatus;
use hive::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use hive::config::AppConfig;
use hive::core::{ExecuteRequest, ExecutionMode, HiveService, Message, Role, ToolCall};
use hive::llm::{LlmGateway, LlmReply, ScriptedLlm};
use hive::tools::Tool;

fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.skills.prompts_dir = dir.path().join("skills");
    config.workflow.templates_path = dir.path().join("workflows");
    config.bridge.config_path = dir.path().join("bridges.json");
    config
}

async fn service_with(
    replies: Vec<LlmReply>,
) -> (Arc<HiveService>, Arc<MemoryCheckpointStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("skills")).unwrap();
    std::fs::create_dir_all(dir.path().join("workflows")).unwrap();

    let config = test_config(&dir);
    let llm = Arc::new(ScriptedLlm::new(replies));
    let gateway = Arc::new(LlmGateway::single(llm, &config.llm));
    let store = Arc::new(MemoryCheckpointStore::new());
    let service = Arc::new(
        HiveService::new(config, gateway, store.clone() as Arc<dyn hive::checkpoint::CheckpointStore>)
            .await,
    );
    (service, store, dir)
}

fn single_request(session: &str, text: &str) -> ExecuteRequest {
    ExecuteRequest {
        mode: ExecutionMode::Single,
        session_id: session.to_string(),
        user_id: Some("u1".to_string()),
        role: "user".to_string(),
        messages: vec![Message::user(text)],
        template: None,
    }
}

struct WebSearchTool {
    invoked: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Search the web for a query"
    }
    async fn execute(&self, _args: Value) -> Result<String, String> {
        self.invoked.store(true, Ordering::SeqCst);
        Ok("doc: X".to_string())
    }
}

struct DeleteRecordTool {
    invoked: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for DeleteRecordTool {
    fn name(&self) -> &str {
        "delete_record"
    }
    fn description(&self) -> &str {
        "Delete a record by id"
    }
    async fn execute(&self, _args: Value) -> Result<String, String> {
        self.invoked.store(true, Ordering::SeqCst);
        Ok("deleted".to_string())
    }
}

// S1：单智能体、无工具
#[tokio::test]
async fn test_single_agent_no_tools() {
    let (service, store, _dir) = service_with(vec![LlmReply::text(
        "Decorators wrap callables to add behavior without changing their source.",
    )])
    .await;

    let state = service
        .execute(single_request("s1", "Explain decorators in 20 words."), None)
        .await
        .unwrap();

    let last = state.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.contains("Decorators"));
    assert!(!state.messages.iter().any(|m| m.role == Role::ToolResult));
    // 一个循环 -> 恰好一个检查点
    assert_eq!(store.count("s1", "agent").await, 1);
}

// S2：单智能体、一次工具循环
#[tokio::test]
async fn test_single_agent_one_tool_cycle() {
    let call = ToolCall::new("web_search", serde_json::json!({"q": "X"}));
    let (service, store, _dir) = service_with(vec![
        LlmReply::text("").with_tool_calls(vec![call]),
        LlmReply::text("Found: doc: X"),
    ])
    .await;

    let invoked = Arc::new(AtomicBool::new(false));
    service
        .tool_registry()
        .register(Arc::new(WebSearchTool {
            invoked: Arc::clone(&invoked),
        }))
        .await;

    let state = service
        .execute(single_request("s2", "Search X"), None)
        .await
        .unwrap();

    let last = state.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "Found: doc: X");

    let tool_results: Vec<&Message> = state
        .messages
        .iter()
        .filter(|m| m.role == Role::ToolResult)
        .collect();
    assert_eq!(tool_results.len(), 1);
    assert_eq!(tool_results[0].content, "doc: X");
    assert!(invoked.load(Ordering::SeqCst));
    // 两个循环 -> 两个检查点
    assert_eq!(store.count("s2", "agent").await, 2);
}

// S3：敏感工具被拦截
#[tokio::test]
async fn test_sensitive_tool_intercepted() {
    let call = ToolCall::new("delete_record", serde_json::json!({"id": 5}));
    let (service, _store, _dir) = service_with(vec![
        LlmReply::text("").with_tool_calls(vec![call]),
        LlmReply::text("The deletion is awaiting human approval."),
    ])
    .await;

    let invoked = Arc::new(AtomicBool::new(false));
    service
        .tool_registry()
        .register(Arc::new(DeleteRecordTool {
            invoked: Arc::clone(&invoked),
        }))
        .await;

    let state = service
        .execute(single_request("s3", "Delete record 5"), None)
        .await
        .unwrap();

    // 审批记录存在且为 pending
    let pending = service.list_pending_approvals("s3").await;
    assert_eq!(pending.len(), 1);
    let request = &pending[0];
    assert_eq!(request.status, ApprovalStatus::Pending);
    assert_eq!(request.action_type, "tool_execution");
    assert_eq!(request.action_data["name"], "delete_record");
    assert_eq!(request.action_data["arguments"]["id"], 5);

    // 下一循环看到 "Approval required, id=" 形状的 tool_result；底层工具未执行
    let stub = state
        .messages
        .iter()
        .find(|m| m.role == Role::ToolResult)
        .unwrap();
    assert!(stub.content.starts_with("Approval required, id="));
    assert!(!invoked.load(Ordering::SeqCst));
}

// S4：多智能体 handoff
#[tokio::test]
async fn test_multi_agent_handoff() {
    let (service, _store, _dir) = service_with(vec![
        LlmReply::text("").with_tool_calls(vec![ToolCall::new(
            "transfer_to_coder",
            serde_json::json!({"request": "write fib"}),
        )]),
        LlmReply::text("def fib(n):\n    return n if n < 2 else fib(n-1) + fib(n-2)"),
    ])
    .await;

    let (tx, mut rx) = hive::agent::channel();
    let state = service
        .execute(
            ExecuteRequest {
                mode: ExecutionMode::Multi,
                session_id: "s4".to_string(),
                user_id: None,
                role: "user".to_string(),
                messages: vec![Message::user("Write fib in Python")],
                template: None,
            },
            Some(&tx),
        )
        .await
        .unwrap();
    drop(tx);

    let last = state.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.contains("def fib"));

    let mut handoffs = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::Handoff { worker } = event {
            handoffs.push(worker);
        }
    }
    assert_eq!(handoffs, vec!["coder".to_string()]);
}

// S5：工作流并行 + 依赖（模板计划；工作者输出进入依赖上下文与合成）
#[tokio::test]
async fn test_workflow_parallel_then_dependent() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("skills")).unwrap();
    std::fs::create_dir_all(dir.path().join("workflows")).unwrap();
    std::fs::write(
        dir.path().join("workflows/fanout.yaml"),
        "name: fanout\ndescription: two parallel steps then a join\nsteps:\n\
         \x20 - id: a\n    worker: researcher\n    task: TASK_A\n\
         \x20 - id: b\n    worker: researcher\n    task: TASK_B\n\
         \x20 - id: c\n    worker: analyst\n    task: TASK_C\n    depends_on: [a, b]\n",
    )
    .unwrap();

    let config = test_config(&dir);
    // 空脚本：每次工作者调用回显其任务文本
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let gateway = Arc::new(LlmGateway::single(llm, &config.llm));
    let store = Arc::new(MemoryCheckpointStore::new());
    let service = Arc::new(
        HiveService::new(config, gateway, store.clone() as Arc<dyn hive::checkpoint::CheckpointStore>)
            .await,
    );

    assert_eq!(
        service.list_workflow_templates(),
        vec![("fanout".to_string(), "two parallel steps then a join".to_string())]
    );

    let state = service
        .execute(
            ExecuteRequest {
                mode: ExecutionMode::Workflow,
                session_id: "s5".to_string(),
                user_id: None,
                role: "user".to_string(),
                messages: vec![Message::user("run the fanout")],
                template: Some("fanout".to_string()),
            },
            None,
        )
        .await
        .unwrap();

    let final_message = state.messages.last().unwrap();
    assert_eq!(final_message.role, Role::Assistant);
    let output = &final_message.content;

    // 三步都有结果，按计划顺序合成
    assert!(output.contains("Workflow Results: fanout"));
    let a_pos = output.find("Step: a").unwrap();
    let b_pos = output.find("Step: b").unwrap();
    let c_pos = output.find("Step: c").unwrap();
    assert!(a_pos < b_pos && b_pos < c_pos);

    // c 的工作者看到了 a、b 的输出（回显里含依赖上下文标记）
    assert!(output.contains("[Result from a]"));
    assert!(output.contains("TASK_A"));
    assert!(output.contains("TASK_B"));
}

// S6：审批解决唤醒等待方
#[tokio::test]
async fn test_approval_resolution_unblocks_waiter() {
    let (service, _store, _dir) = service_with(vec![]).await;
    let gate = service.approval_gate();

    let request = gate
        .create(
            "s6",
            None,
            "test",
            "desc",
            serde_json::json!({}),
            Some(Duration::from_secs(60)),
        )
        .await;

    let waiter_gate = Arc::clone(&gate);
    let request_id = request.id.clone();
    let waiter =
        tokio::spawn(async move { waiter_gate.wait(&request_id, Duration::from_secs(10)).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    service.approve("s6", &request.id, Some("ok")).await.unwrap();

    let resolved = waiter.await.unwrap().unwrap();
    assert_eq!(resolved.status, ApprovalStatus::Approved);
    assert_eq!(resolved.reviewer_comment.as_deref(), Some("ok"));
    assert!(resolved.resolved_at.is_some());

    // 其后的 reject 幂等返回 approved 记录
    let after = service.reject("s6", &request.id, None).await.unwrap();
    assert_eq!(after.status, ApprovalStatus::Approved);
}

// 属性：历史单调增长（后一次 execute 的消息表是前一次的前缀扩展）
#[tokio::test]
async fn test_monotone_history_across_requests() {
    let (service, _store, _dir) =
        service_with(vec![LlmReply::text("one"), LlmReply::text("two")]).await;

    let first = service
        .execute(single_request("s7", "first turn"), None)
        .await
        .unwrap();
    let second = service
        .execute(single_request("s7", "second turn"), None)
        .await
        .unwrap();

    assert!(second.messages.len() > first.messages.len());
    // 指令中间件会刷新头部指令；其后的历史必须逐条保持
    let first_tail: Vec<&str> = first.messages[1..].iter().map(|m| m.id.as_str()).collect();
    let second_tail: Vec<&str> = second.messages[1..=first_tail.len()]
        .iter()
        .map(|m| m.id.as_str())
        .collect();
    assert_eq!(first_tail, second_tail);
}

// 属性：同会话并发请求串行化（检查点父链无分叉）
#[tokio::test]
async fn test_concurrent_same_session_serializes() {
    let (service, store, _dir) =
        service_with(vec![LlmReply::text("r1"), LlmReply::text("r2")]).await;

    let s_a = Arc::clone(&service);
    let s_b = Arc::clone(&service);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { s_a.execute(single_request("s8", "turn a"), None).await }),
        tokio::spawn(async move { s_b.execute(single_request("s8", "turn b"), None).await }),
    );
    a.unwrap().unwrap();
    b.unwrap().unwrap();

    let chain = store.list("s8", "agent").await.unwrap();
    assert_eq!(chain.len(), 2);
    assert!(chain[0].parent_checkpoint_id.is_none());
    assert_eq!(
        chain[1].parent_checkpoint_id.as_deref(),
        Some(chain[0].checkpoint_id.as_str())
    );
}

// 角色过滤：非 admin 不可见技能变更工具，admin 可见
#[tokio::test]
async fn test_role_scoped_tool_views() {
    let (service, _store, _dir) = service_with(vec![]).await;
    let registry = service.tool_registry();

    let user_tools: Vec<String> = registry
        .list("user")
        .await
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    assert!(user_tools.contains(&"load_skill".to_string()));
    assert!(!user_tools.contains(&"create_skill".to_string()));

    let admin_tools: Vec<String> = registry
        .list("admin")
        .await
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    assert!(admin_tools.contains(&"create_skill".to_string()));
    assert!(admin_tools.contains(&"update_skill".to_string()));
}

// 流式：块拼接等于最终回复，Done 收尾
#[tokio::test]
async fn test_stream_chunks_reassemble_final_reply() {
    let (service, _store, _dir) = service_with(vec![LlmReply::text("streamed answer")]).await;

    let (mut rx, handle) = Arc::clone(&service).execute_stream(single_request("s9", "hello"));
    let state = handle.await.unwrap().unwrap();

    let mut chunks = String::new();
    let mut saw_done = false;
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::MessageChunk { text } => chunks.push_str(&text),
            AgentEvent::Done => saw_done = true,
            _ => {}
        }
    }
    assert!(saw_done);
    assert_eq!(chunks, state.messages.last().unwrap().content);
}
