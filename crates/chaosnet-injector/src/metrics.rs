//! 指标上报接缝
//!
//! 引擎只通过 [`MetricsSink`] 上报事件，具体的指标后端（例如 Prometheus）由使用方实现。

/// 指标接收器
pub trait MetricsSink: Send + Sync {
    /// 安装了若干条过滤器
    fn filters_installed(&self, _count: usize) {}

    /// 删除了若干条过滤器
    fn filters_removed(&self, _count: usize) {}

    /// 监听器执行了一次自修复
    fn watcher_repaired(&self, _watcher: &str) {}
}

/// 不记录任何指标
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
