//! 外部工具桥接
//!
//! 从 JSON 配置文件（enabled 开关）连接桥接端点，发现其工具并以
//! `<bridge>.<tool>` 命名注册到工具注册表；调用时透传。发现失败只记录日志，
//! 绝不阻塞进行中的请求。

pub mod protocol;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{Tool, ToolRegistry};
use protocol::{BridgeRequest, BridgeResponse, CallToolResult, ListToolsResult, ToolDescriptor};

/// 单个桥接端点配置
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BridgeConfigFile {
    #[serde(default)]
    bridges: Vec<BridgeConfig>,
}

/// 加载桥接配置；文件缺失不是错误（返回空列表），禁用项被跳过
pub fn load_bridge_configs(path: impl AsRef<Path>) -> Vec<BridgeConfig> {
    let path = path.as_ref();
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            tracing::info!(path = %path.display(), "bridge_config_not_found");
            return Vec::new();
        }
    };
    match serde_json::from_str::<BridgeConfigFile>(&content) {
        Ok(file) => file.bridges.into_iter().filter(|b| b.enabled).collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "bridge_config_parse_failed");
            Vec::new()
        }
    }
}

/// 桥接契约：列出工具、透传调用
#[async_trait]
pub trait ToolBridge: Send + Sync {
    fn name(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String>;
    async fn invoke(&self, name: &str, args: Value) -> Result<String, String>;
}

/// HTTP JSON-RPC 桥接客户端
pub struct HttpToolBridge {
    name: String,
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpToolBridge {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn rpc(&self, request: BridgeRequest) -> Result<Value, String> {
        let response: BridgeResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("bridge {} unreachable: {}", self.name, e))?
            .json()
            .await
            .map_err(|e| format!("bridge {} bad response: {}", self.name, e))?;

        if let Some(err) = response.error {
            return Err(format!("bridge {} error {}: {}", self.name, err.code, err.message));
        }
        response
            .result
            .ok_or_else(|| format!("bridge {} empty result", self.name))
    }
}

#[async_trait]
impl ToolBridge for HttpToolBridge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = self.rpc(BridgeRequest::list_tools(id)).await?;
        let parsed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| format!("tools/list parse: {}", e))?;
        Ok(parsed.tools)
    }

    async fn invoke(&self, name: &str, args: Value) -> Result<String, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = self.rpc(BridgeRequest::call_tool(id, name, args)).await?;
        let parsed: CallToolResult =
            serde_json::from_value(result).map_err(|e| format!("tools/call parse: {}", e))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        if parsed.is_error {
            Err(text)
        } else {
            Ok(text)
        }
    }
}

/// 桥接工具包装：描述符缓存于发现时刻，调用时透传给桥接端
pub struct BridgeTool {
    qualified_name: String,
    descriptor: ToolDescriptor,
    bridge: Arc<dyn ToolBridge>,
}

#[async_trait]
impl Tool for BridgeTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn parameters(&self) -> Value {
        if self.descriptor.input_schema.is_null() {
            serde_json::json!({"type": "object", "properties": {}})
        } else {
            self.descriptor.input_schema.clone()
        }
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.bridge.invoke(&self.descriptor.name, args).await
    }
}

/// 从单个桥接发现工具并注册（覆盖同命名空间旧条目），返回注册数
pub async fn discover(registry: &ToolRegistry, bridge: Arc<dyn ToolBridge>) -> usize {
    let descriptors = match bridge.list_tools().await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(bridge = bridge.name(), error = %e, "bridge_discovery_failed");
            return 0;
        }
    };

    let prefix = format!("{}.", bridge.name());
    registry.remove_namespace(&prefix).await;

    let count = descriptors.len();
    for descriptor in descriptors {
        let qualified_name = format!("{}{}", prefix, descriptor.name);
        registry
            .register(Arc::new(BridgeTool {
                qualified_name,
                descriptor,
                bridge: Arc::clone(&bridge),
            }))
            .await;
    }

    tracing::info!(bridge = bridge.name(), tools_count = count, "bridge_tools_discovered");
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticBridge;

    #[async_trait]
    impl ToolBridge for StaticBridge {
        fn name(&self) -> &str {
            "search"
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
            Ok(vec![ToolDescriptor {
                name: "web_lookup".to_string(),
                description: "Look up a page".to_string(),
                input_schema: serde_json::json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            }])
        }

        async fn invoke(&self, name: &str, args: Value) -> Result<String, String> {
            Ok(format!("{}:{}", name, args["q"].as_str().unwrap_or("")))
        }
    }

    struct BrokenBridge;

    #[async_trait]
    impl ToolBridge for BrokenBridge {
        fn name(&self) -> &str {
            "broken"
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
            Err("connection refused".to_string())
        }

        async fn invoke(&self, _name: &str, _args: Value) -> Result<String, String> {
            Err("connection refused".to_string())
        }
    }

    #[tokio::test]
    async fn test_discover_registers_namespaced_tools() {
        let registry = ToolRegistry::new(5);
        let count = discover(&registry, Arc::new(StaticBridge)).await;
        assert_eq!(count, 1);

        let out = registry
            .execute("search.web_lookup", "user", serde_json::json!({"q": "X"}))
            .await
            .unwrap();
        assert_eq!(out, "web_lookup:X");
    }

    #[tokio::test]
    async fn test_discovery_failure_is_nonfatal() {
        let registry = ToolRegistry::new(5);
        let count = discover(&registry, Arc::new(BrokenBridge)).await;
        assert_eq!(count, 0);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_rediscovery_replaces_namespace() {
        let registry = ToolRegistry::new(5);
        discover(&registry, Arc::new(StaticBridge)).await;
        discover(&registry, Arc::new(StaticBridge)).await;
        assert_eq!(registry.count().await, 1);
    }

    #[test]
    fn test_load_bridge_configs_skips_disabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bridges.json");
        std::fs::write(
            &path,
            r#"{"bridges": [
                {"name": "search", "url": "http://localhost:9001/rpc"},
                {"name": "off", "url": "http://localhost:9002/rpc", "enabled": false}
            ]}"#,
        )
        .unwrap();

        let configs = load_bridge_configs(&path);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "search");

        // 缺失文件不报错
        assert!(load_bridge_configs(dir.path().join("missing.json")).is_empty());
    }
}
