//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    /// 停止指标 HTTP 服务器
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // 保存到全局，供其他地方获取指标快照
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册规则引擎指标描述
fn register_common_metrics(service_name: &str) {
    // 这些描述会出现在 /metrics 端点的 HELP 注释中
    metrics::describe_counter!(
        "rule_engine_evaluations_total",
        "Total number of query evaluations"
    );
    metrics::describe_counter!(
        "rule_engine_blocked_total",
        "Total number of queries blocked by rules"
    );
    metrics::describe_histogram!(
        "rule_engine_evaluation_duration_seconds",
        "Query evaluation duration in seconds"
    );
    metrics::describe_counter!(
        "rule_engine_rule_errors_total",
        "Total number of per-rule evaluation failures"
    );
    metrics::describe_counter!(
        "rule_engine_cache_lookups_total",
        "Total number of evaluation cache lookups"
    );
    metrics::describe_counter!(
        "rule_engine_reloads_total",
        "Total number of ruleset reloads"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次查询评估
#[inline]
pub fn record_query_evaluation(trigger: &str, allowed: bool, timed_out: bool, duration_secs: f64) {
    let outcome = if timed_out {
        "timeout"
    } else if allowed {
        "allowed"
    } else {
        "blocked"
    };

    metrics::counter!(
        "rule_engine_evaluations_total",
        "trigger" => trigger.to_string(),
        "outcome" => outcome
    )
    .increment(1);

    if !allowed {
        metrics::counter!("rule_engine_blocked_total", "trigger" => trigger.to_string())
            .increment(1);
    }

    metrics::histogram!(
        "rule_engine_evaluation_duration_seconds",
        "trigger" => trigger.to_string()
    )
    .record(duration_secs);
}

/// 记录单条规则评估失败
#[inline]
pub fn record_rule_error(kind: &'static str) {
    metrics::counter!("rule_engine_rule_errors_total", "kind" => kind).increment(1);
}

/// 记录缓存命中情况
#[inline]
pub fn record_cache_lookup(hit: bool) {
    metrics::counter!(
        "rule_engine_cache_lookups_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// 记录规则集重新加载
#[inline]
pub fn record_reload(success: bool) {
    metrics::counter!(
        "rule_engine_reloads_total",
        "status" => if success { "success" } else { "failure" }
    )
    .increment(1);
}
