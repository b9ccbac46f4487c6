//! 可观测性
//!
//! 提供 tracing 初始化与结构化 metrics：
//! - LLM 调用次数 / 错误率 / 按模型名的延迟直方图
//! - 工具执行时间
//! - 审批生命周期计数

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 直方图桶边界（秒）：模型调用延迟
const LATENCY_BUCKETS: [f64; 8] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

/// 单模型的延迟直方图（固定桶 + 计数 + 总和）
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    /// 每桶累计计数，与 LATENCY_BUCKETS 对齐；末位为 +Inf 桶
    buckets: [AtomicU64; 9],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let idx = LATENCY_BUCKETS
            .iter()
            .position(|b| secs <= *b)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn average_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
        }
    }
}

/// LLM 相关指标
#[derive(Debug, Default)]
pub struct LlmMetrics {
    pub total_calls: AtomicU64,
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub retries: AtomicU64,
    pub ring_rotations: AtomicU64,
    /// 模型名 -> 延迟直方图
    latency: RwLock<HashMap<String, LatencyHistogram>>,
}

impl LlmMetrics {
    /// 每次后端调用（含重试）记一次成败
    pub fn record_call(&self, success: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 模型调用墙钟耗时入直方图（指标探针中间件调用）
    pub fn observe_latency(&self, model: &str, latency: Duration) {
        {
            let read = self.latency.read().unwrap();
            if let Some(h) = read.get(model) {
                h.observe(latency);
                return;
            }
        }
        let mut write = self.latency.write().unwrap();
        write.entry(model.to_string()).or_default().observe(latency);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.ring_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    /// 指定模型的调用次数（直方图计数）
    pub fn model_call_count(&self, model: &str) -> u64 {
        self.latency
            .read()
            .unwrap()
            .get(model)
            .map(|h| h.count())
            .unwrap_or(0)
    }
}

/// 工具相关指标
#[derive(Debug, Default)]
pub struct ToolMetrics {
    pub total_executions: AtomicU64,
    pub successful_executions: AtomicU64,
    pub failed_executions: AtomicU64,
    pub intercepted: AtomicU64,
    pub total_execution_time_ms: AtomicU64,
}

impl ToolMetrics {
    pub fn record_execution(&self, success: bool, duration: Duration) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_executions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
        self.total_execution_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// 敏感调用被审批门拦截
    pub fn record_interception(&self) {
        self.intercepted.fetch_add(1, Ordering::Relaxed);
    }
}

/// 审批相关指标
#[derive(Debug, Default)]
pub struct ApprovalMetrics {
    pub created: AtomicU64,
    pub approved: AtomicU64,
    pub rejected: AtomicU64,
    pub expired: AtomicU64,
}

/// 全局指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    pub llm: LlmMetrics,
    pub tools: ToolMetrics,
    pub approvals: ApprovalMetrics,
    pub requests: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取全局指标实例
    pub fn global() -> &'static Metrics {
        static INSTANCE: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(Metrics::new)
    }

    /// 导出为 Prometheus 文本格式
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "# TYPE hive_llm_calls_total counter\nhive_llm_calls_total {}\n",
            self.llm.total_calls.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_llm_calls_failure counter\nhive_llm_calls_failure {}\n",
            self.llm.failed_calls.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_llm_retries_total counter\nhive_llm_retries_total {}\n",
            self.llm.retries.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_llm_ring_rotations_total counter\nhive_llm_ring_rotations_total {}\n",
            self.llm.ring_rotations.load(Ordering::Relaxed)
        ));

        {
            let latency = self.llm.latency.read().unwrap();
            output.push_str("# TYPE hive_llm_latency_seconds histogram\n");
            for (model, hist) in latency.iter() {
                let mut cumulative = 0u64;
                for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
                    cumulative += hist.buckets[i].load(Ordering::Relaxed);
                    output.push_str(&format!(
                        "hive_llm_latency_seconds_bucket{{model=\"{}\",le=\"{}\"}} {}\n",
                        model, bound, cumulative
                    ));
                }
                cumulative += hist.buckets[LATENCY_BUCKETS.len()].load(Ordering::Relaxed);
                output.push_str(&format!(
                    "hive_llm_latency_seconds_bucket{{model=\"{}\",le=\"+Inf\"}} {}\n",
                    model, cumulative
                ));
                output.push_str(&format!(
                    "hive_llm_latency_seconds_count{{model=\"{}\"}} {}\n",
                    model,
                    hist.count.load(Ordering::Relaxed)
                ));
            }
        }

        output.push_str(&format!(
            "# TYPE hive_tool_executions_total counter\nhive_tool_executions_total {}\n",
            self.tools.total_executions.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_tool_executions_failure counter\nhive_tool_executions_failure {}\n",
            self.tools.failed_executions.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_tool_intercepted_total counter\nhive_tool_intercepted_total {}\n",
            self.tools.intercepted.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# TYPE hive_approvals_created counter\nhive_approvals_created {}\n",
            self.approvals.created.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_approvals_approved counter\nhive_approvals_approved {}\n",
            self.approvals.approved.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_approvals_rejected counter\nhive_approvals_rejected {}\n",
            self.approvals.rejected.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "# TYPE hive_approvals_expired counter\nhive_approvals_expired {}\n",
            self.approvals.expired.load(Ordering::Relaxed)
        ));

        output.push_str(&format!(
            "# TYPE hive_requests_total counter\nhive_requests_total {}\n",
            self.requests.load(Ordering::Relaxed)
        ));

        output
    }
}
