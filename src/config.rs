//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__DEFAULT_MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub summarization: SummarizationSection,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default)]
    pub skills: SkillsSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    /// 工作者目录：[[workers]]，为空时使用内置默认目录（researcher / coder / analyst）
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,
}

/// [llm] 段：模型环、重试与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 默认模型（模型环的起点）
    #[serde(default = "default_model")]
    pub default_model: String,
    /// 模型环：有序、循环；一个后端重试耗尽后切到下一个
    #[serde(default = "default_model_ring")]
    pub model_ring: Vec<String>,
    /// OpenAI 兼容端点 base_url（未设置时用官方端点）
    pub base_url: Option<String>,
    /// 每个后端的重试次数
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// 重试退避基数（秒），第 n 次等待 base * 2^n
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base_seconds: f64,
    /// 单次后端调用超时（秒）
    #[serde(default = "default_backend_timeout")]
    pub per_backend_timeout_seconds: u64,
    /// 单个后端的并发上限（避免触发供应商限流）
    #[serde(default = "default_backend_concurrency")]
    pub per_backend_concurrency: usize,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_model_ring() -> Vec<String> {
    vec!["gpt-4o-mini".to_string(), "gpt-4o".to_string()]
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_base() -> f64 {
    1.0
}

fn default_backend_timeout() -> u64 {
    60
}

fn default_backend_concurrency() -> usize {
    4
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            model_ring: default_model_ring(),
            base_url: None,
            retry_attempts: default_retry_attempts(),
            retry_backoff_base_seconds: default_retry_backoff_base(),
            per_backend_timeout_seconds: default_backend_timeout(),
            per_backend_concurrency: default_backend_concurrency(),
        }
    }
}

/// [agent] 段：循环上限与请求预算
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 单次请求最大 Agent 循环数，防止死循环
    #[serde(default = "default_cycle_cap")]
    pub cycle_cap: usize,
    /// 单次请求总预算（秒）
    #[serde(default = "default_request_budget")]
    pub per_request_budget_seconds: u64,
}

fn default_cycle_cap() -> usize {
    25
}

fn default_request_budget() -> u64 {
    600
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            cycle_cap: default_cycle_cap(),
            per_request_budget_seconds: default_request_budget(),
        }
    }
}

/// [summarization] 段：对话历史压缩
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizationSection {
    /// 触发压缩的估算 token 数
    #[serde(default = "default_trigger_tokens")]
    pub trigger_tokens: usize,
    /// 压缩后保留的最近消息条数
    #[serde(default = "default_keep_messages")]
    pub keep_messages: usize,
    /// 压缩使用的模型（为空时使用默认模型）
    #[serde(default)]
    pub model: Option<String>,
}

fn default_trigger_tokens() -> usize {
    4000
}

fn default_keep_messages() -> usize {
    20
}

impl Default for SummarizationSection {
    fn default() -> Self {
        Self {
            trigger_tokens: default_trigger_tokens(),
            keep_messages: default_keep_messages(),
            model: None,
        }
    }
}

/// [approval] 段：审批 TTL、过期清扫间隔与敏感工具模式
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalSection {
    /// 审批请求有效期（秒）
    #[serde(default = "default_approval_ttl")]
    pub ttl_seconds: u64,
    /// 过期清扫任务的间隔（秒）
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// 敏感工具名模式（子串匹配，命中即拦截送审）
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,
}

fn default_approval_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sensitive_patterns() -> Vec<String> {
    vec![
        "delete".into(),
        "modify".into(),
        "update".into(),
        "write".into(),
        "execute_sql".into(),
        "send_email".into(),
        "create_skill".into(),
        "update_skill".into(),
    ]
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            ttl_seconds: default_approval_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
            sensitive_patterns: default_sensitive_patterns(),
        }
    }
}

/// [skills] 段：技能 Markdown 目录
#[derive(Debug, Clone, Deserialize)]
pub struct SkillsSection {
    /// 技能目录；自动生成的技能写入其下 _auto/ 子目录
    #[serde(default = "default_skills_dir")]
    pub prompts_dir: PathBuf,
}

fn default_skills_dir() -> PathBuf {
    PathBuf::from("config/skills")
}

impl Default for SkillsSection {
    fn default() -> Self {
        Self {
            prompts_dir: default_skills_dir(),
        }
    }
}

/// [workflow] 段：YAML 模板目录
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_templates_dir")]
    pub templates_path: PathBuf,
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("config/workflows")
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            templates_path: default_templates_dir(),
        }
    }
}

/// [bridge] 段：外部工具桥接配置文件（JSON，枚举各桥接端点与 enabled 开关）
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_bridge_config")]
    pub config_path: PathBuf,
}

fn default_bridge_config() -> PathBuf {
    PathBuf::from("config/bridges.json")
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            config_path: default_bridge_config(),
        }
    }
}

/// 单条工作者配置：[[workers]]
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerEntry {
    /// 工作者名（handoff 工具名为 transfer_to_<name>）
    pub name: String,
    /// 供 Supervisor 路由决策的简短描述
    pub description: String,
    /// 工作者的系统指令
    pub system_directive: String,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
