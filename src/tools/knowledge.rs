//! 知识检索工具
//!
//! retrieve_knowledge(query, k) 的实现由外部检索管理器提供（多 provider 聚合）；
//! 核心只依赖 KnowledgeRetriever 契约，并把命中渲染为带来源与评分的文本。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// 单条检索命中
#[derive(Clone, Debug)]
pub struct KnowledgeHit {
    pub content: String,
    pub score: f64,
    pub source: String,
}

/// 外部检索契约
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<KnowledgeHit>, String>;
}

const DEFAULT_K: usize = 5;

/// retrieve_knowledge(query, k)
pub struct RetrieveKnowledgeTool {
    retriever: Arc<dyn KnowledgeRetriever>,
}

impl RetrieveKnowledgeTool {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for RetrieveKnowledgeTool {
    fn name(&self) -> &str {
        "retrieve_knowledge"
    }

    fn description(&self) -> &str {
        "Retrieve relevant knowledge base passages for a query"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "k": {"type": "integer", "description": "Number of passages to return", "default": DEFAULT_K}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing required argument: query".to_string())?;
        let k = args
            .get("k")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_K);

        let hits = self.retriever.retrieve(query, k).await?;
        if hits.is_empty() {
            return Ok("No relevant knowledge found.".to_string());
        }

        let rendered: Vec<String> = hits
            .iter()
            .map(|h| format!("[{} | score {:.2}]\n{}", h.source, h.score, h.content))
            .collect();
        Ok(rendered.join("\n\n"))
    }
}
