//! 工具层：注册表、内置技能/知识工具、外部桥接

pub mod bridge;
pub mod knowledge;
pub mod registry;
pub mod skills_tools;

pub use bridge::{discover, load_bridge_configs, BridgeConfig, HttpToolBridge, ToolBridge};
pub use knowledge::{KnowledgeHit, KnowledgeRetriever, RetrieveKnowledgeTool};
pub use registry::{Tool, ToolLookupError, ToolRegistry};
pub use skills_tools::{CreateSkillTool, ListSkillsTool, LoadSkillTool, UpdateSkillTool};
