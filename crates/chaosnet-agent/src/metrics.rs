//! 指标收集与导出模块
//!
//! 该模块统计注入/清理的结果、过滤器的安装与删除次数以及监听器自修复次数，
//! 并通过 Prometheus 文本格式在 `/metrics` 上导出。

use anyhow::Result;
use chaosnet_injector::MetricsSink;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// 指标收集器
pub struct PrometheusMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 注入次数（按结果）
    injections_total: IntCounterVec,
    /// 清理次数（按结果）
    cleans_total: IntCounterVec,
    /// 安装的过滤器总数
    filters_installed_total: IntCounter,
    /// 删除的过滤器总数
    filters_removed_total: IntCounter,
    /// 当前由引擎登记的过滤器数
    active_filters: IntGauge,
    /// 监听器自修复次数
    watcher_repairs_total: IntCounterVec,
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

impl PrometheusMetrics {
    /// 创建新的指标收集器
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let injections_total = IntCounterVec::new(
            Opts::new("chaosnet_injections_total", "Total number of network disruption injections"),
            &["outcome"],
        )?;
        let cleans_total = IntCounterVec::new(
            Opts::new("chaosnet_cleans_total", "Total number of network disruption cleanups"),
            &["outcome"],
        )?;
        let filters_installed_total = IntCounter::new(
            "chaosnet_tc_filters_installed_total",
            "Total number of tc filters installed",
        )?;
        let filters_removed_total = IntCounter::new(
            "chaosnet_tc_filters_removed_total",
            "Total number of tc filters removed",
        )?;
        let active_filters = IntGauge::new(
            "chaosnet_tc_filters_active",
            "Number of tc filters currently tracked by the injector",
        )?;
        let watcher_repairs_total = IntCounterVec::new(
            Opts::new("chaosnet_watcher_repairs_total", "Total number of watcher self-repairs"),
            &["watcher"],
        )?;

        registry.register(Box::new(injections_total.clone()))?;
        registry.register(Box::new(cleans_total.clone()))?;
        registry.register(Box::new(filters_installed_total.clone()))?;
        registry.register(Box::new(filters_removed_total.clone()))?;
        registry.register(Box::new(active_filters.clone()))?;
        registry.register(Box::new(watcher_repairs_total.clone()))?;

        Ok(Self {
            registry,
            injections_total,
            cleans_total,
            filters_installed_total,
            filters_removed_total,
            active_filters,
            watcher_repairs_total,
        })
    }

    /// 记录一次注入
    pub fn record_injection(&self, success: bool) {
        self.injections_total.with_label_values(&[outcome(success)]).inc();
    }

    /// 记录一次清理；清理后内核中不再有过滤器
    pub fn record_clean(&self, success: bool) {
        self.cleans_total.with_label_values(&[outcome(success)]).inc();
        self.active_filters.set(0);
    }

    /// 以 Prometheus 文本格式导出
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    /// 启动指标服务器
    pub fn start_metrics_server(self: &Arc<Self>, addr: SocketAddr) {
        let metrics = self.clone();

        let serve_future = async move {
            let make_svc = make_service_fn(move |_| {
                let metrics = metrics.clone();
                async move {
                    Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                        let metrics = metrics.clone();
                        async move { metrics_response(&metrics, req.uri().path()) }
                    }))
                }
            });

            info!("指标服务器启动在 {}", addr);

            if let Err(e) = Server::bind(&addr).serve(make_svc).await {
                error!("指标服务器错误: {}", e);
            }
        };

        tokio::spawn(serve_future);
    }
}

fn metrics_response(metrics: &PrometheusMetrics, path: &str) -> hyper::http::Result<Response<Body>> {
    if path != "/metrics" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty());
    }

    match metrics.render() {
        Ok((content_type, buffer)) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", content_type)
            .body(Body::from(buffer)),
        Err(e) => {
            error!("编码指标失败: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from(e.to_string()))
        }
    }
}

impl MetricsSink for PrometheusMetrics {
    fn filters_installed(&self, count: usize) {
        self.filters_installed_total.inc_by(count as u64);
        self.active_filters.add(count as i64);
    }

    fn filters_removed(&self, count: usize) {
        self.filters_removed_total.inc_by(count as u64);
        self.active_filters.sub(count as i64);
    }

    fn watcher_repaired(&self, watcher: &str) {
        self.watcher_repairs_total.with_label_values(&[watcher]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_updates_counters() {
        let metrics = PrometheusMetrics::new().unwrap();

        metrics.filters_installed(3);
        metrics.filters_removed(1);
        metrics.watcher_repaired("service");
        metrics.record_injection(true);

        assert_eq!(metrics.filters_installed_total.get(), 3);
        assert_eq!(metrics.filters_removed_total.get(), 1);
        assert_eq!(metrics.active_filters.get(), 2);
        assert_eq!(
            metrics.watcher_repairs_total.with_label_values(&["service"]).get(),
            1
        );

        metrics.record_clean(false);
        assert_eq!(metrics.active_filters.get(), 0);
        assert_eq!(metrics.cleans_total.with_label_values(&["failure"]).get(), 1);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_injection(false);

        let (content_type, body) = metrics.render().unwrap();
        let body = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("chaosnet_injections_total{outcome=\"failure\"} 1"));
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let metrics = PrometheusMetrics::new().unwrap();

        let response = metrics_response(&metrics, "/healthz").unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = metrics_response(&metrics, "/metrics").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
