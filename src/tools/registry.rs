//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters / execute），按名注册与查找；
//! 读多写少：写只发生在启动与显式刷新，经写锁对后续请求原子可见。
//! execute 统一加超时并输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::llm::ToolSpec;
use crate::observability::Metrics;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 Schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象
    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    /// 敏感类工具（审批门的模式匹配之外的显式标记）
    fn is_sensitive(&self) -> bool {
        false
    }

    /// 需要的最低角色；None 表示任意角色可见
    fn required_role(&self) -> Option<&str> {
        None
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具查找错误
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ToolLookupError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Tool {0} forbidden for role {1}")]
    Forbidden(String, String),
}

fn role_allows(required: Option<&str>, role: &str) -> bool {
    match required {
        None => true,
        // admin 可见一切；其余要求精确匹配
        Some(req) => role == "admin" || role == req,
    }
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// 工具注册表
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    tool_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(tool_timeout_secs: u64) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            tool_timeout: Duration::from_secs(tool_timeout_secs.max(1)),
        }
    }

    /// 按名注册；重复注册覆盖
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name, tool);
    }

    /// 解析工具名；角色不满足时 Forbidden
    pub async fn resolve(
        &self,
        name: &str,
        role: &str,
    ) -> Result<Arc<dyn Tool>, ToolLookupError> {
        let tools = self.tools.read().await;
        let tool = tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolLookupError::NotFound(name.to_string()))?;
        if !role_allows(tool.required_role(), role) {
            return Err(ToolLookupError::Forbidden(
                name.to_string(),
                role.to_string(),
            ));
        }
        Ok(tool)
    }

    /// 角色可见的工具列表（按名排序，保证 prompt 稳定）
    pub async fn list(&self, role: &str) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        let mut visible: Vec<Arc<dyn Tool>> = tools
            .values()
            .filter(|t| role_allows(t.required_role(), role))
            .cloned()
            .collect();
        visible.sort_by(|a, b| a.name().cmp(b.name()));
        visible
    }

    /// 绑定给模型的 ToolSpec 列表
    pub async fn specs(&self, role: &str) -> Vec<ToolSpec> {
        self.list(role)
            .await
            .iter()
            .map(|t| {
                ToolSpec::new(t.name(), t.description()).with_parameters(t.parameters())
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// 执行指定工具；超时与失败统一转字符串错误；输出 JSON 审计日志
    pub async fn execute(&self, name: &str, role: &str, args: Value) -> Result<String, String> {
        let tool = self.resolve(name, role).await.map_err(|e| e.to_string())?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let metrics = Metrics::global();

        let result = timeout(self.tool_timeout, tool.execute(args)).await;

        let (outcome, success) = match &result {
            Ok(Ok(_)) => ("ok", true),
            Ok(Err(_)) => ("error", false),
            Err(_) => ("timeout", false),
        };
        let duration = start.elapsed();
        metrics.tools.record_execution(success, duration);

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "outcome": outcome,
            "duration_ms": duration.as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool_call_executed");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!("tool {} timed out", name)),
        }
    }

    /// 移除指定命名空间前缀下的全部工具（桥接刷新时先清空旧条目）
    pub async fn remove_namespace(&self, prefix: &str) -> usize {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|name, _| !name.starts_with(prefix));
        before - tools.len()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
