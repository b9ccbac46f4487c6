//! 外部工具桥接协议类型（JSON-RPC 2.0）

use serde::{Deserialize, Serialize};

/// 桥接端点暴露的工具描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// 发往桥接端点的请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl BridgeRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// tools/list 请求
    pub fn list_tools(id: u64) -> Self {
        Self::new(id, "tools/list", None)
    }

    /// tools/call 请求
    pub fn call_tool(id: u64, name: &str, arguments: serde_json::Value) -> Self {
        Self::new(
            id,
            "tools/call",
            Some(serde_json::json!({
                "name": name,
                "arguments": arguments
            })),
        )
    }
}

/// 桥接端点响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeErrorBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeErrorBody {
    pub code: i32,
    pub message: String,
}

/// tools/list 的 result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolDescriptor>,
}

/// tools/call 的 result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
}

/// 工具结果内容块
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "resource")]
    Resource {
        uri: String,
        #[serde(default)]
        text: Option<String>,
    },
}

impl ContentBlock {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Resource { text, .. } => text.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shapes() {
        let req = BridgeRequest::call_tool(7, "web_lookup", serde_json::json!({"q": "X"}));
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.method, "tools/call");
        assert_eq!(req.params.as_ref().unwrap()["name"], "web_lookup");
    }

    #[test]
    fn test_call_result_text_extraction() {
        let raw = serde_json::json!({
            "content": [{"type": "text", "text": "doc: X"}],
            "is_error": false
        });
        let result: CallToolResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.content[0].as_text(), Some("doc: X"));
    }
}
