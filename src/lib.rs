//! Hive - Agent 编排核心
//!
//! 模块划分：
//! - **agent**: Agent 循环驱动器（推理 -> 工具 -> 推理，直到无工具调用）
//! - **approval**: 人工审批门（敏感工具拦截、审批生命周期、完成信号）
//! - **checkpoint**: 按 (thread_id, namespace) 持久化会话状态快照
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、请求上下文、消息/状态模型、服务入口
//! - **llm**: LLM 网关（模型环、重试回退、并发上限、流式）
//! - **middleware**: 模型调用与工具调用的可组合包装层
//! - **observability**: tracing 初始化与指标（按模型的延迟直方图）
//! - **router**: 多智能体路由（Supervisor + Handoff 工具）
//! - **skills**: 技能注册表（Markdown frontmatter）与 LLM 技能生成器
//! - **tools**: 工具注册表、内置工具、外部工具桥接
//! - **workflow**: 工作流计划、模板、调度器（并行扇出 + 合并）

pub mod agent;
pub mod approval;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod llm;
pub mod middleware;
pub mod observability;
pub mod router;
pub mod skills;
pub mod tools;
pub mod workflow;
