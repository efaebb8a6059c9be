//! 实时监听模块
//!
//! 注入完成后，监听器在后台持续把目标的变化（DNS 解析结果、Service/Pod 变化）同步为过滤器增删。
//! 每个监听器只修改自己登记的过滤器，所有内核变更都在各自的命名空间进入/退出之间完成。
//! 监听器内部的错误只记录日志并修复本地状态，从不传播给注入器。

pub mod hosts;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::filters::FilterRegistry;
use crate::metrics::MetricsSink;
use crate::netns::Netns;

pub use hosts::HostsWatcher;
pub use service::ServiceWatcher;

/// 监听通道打开失败后的重试间隔
pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// 监听器共享的上下文
#[derive(Clone)]
pub struct WatcherContext {
    /// 目标网络命名空间
    pub netns: Arc<dyn Netns>,
    /// 过滤器登记表
    pub registry: Arc<FilterRegistry>,
    /// 命名空间内的全部网卡
    pub interfaces: Arc<Vec<String>>,
    /// 指标接收器
    pub metrics: Arc<dyn MetricsSink>,
}

/// 等待 `delay` 或者取消；被取消时返回 `true`
pub async fn wait_or_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_early_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(wait_or_cancelled(&cancel, Duration::from_secs(3600)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_elapses_without_cancellation() {
        let cancel = CancellationToken::new();
        assert!(!wait_or_cancelled(&cancel, WATCH_RETRY_DELAY).await);
    }
}
