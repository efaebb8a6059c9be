//! ChaosNet Injector - 网络故障注入引擎
//!
//! 该模块在目标网络命名空间内构建 tc qdisc/过滤器树，并通过 iptables 与 cgroup
//! 把故障限定在单个容器上。注入完成后，后台监听器持续把 DNS 解析结果和
//! Kubernetes 服务/Pod 的变化同步为过滤器的增删。
//!
//! 与内核和集群的交互全部经过 trait 接缝（[`network`]、[`netns`]、[`cgroup`]、[`cluster`]），
//! [`fake`] 提供记录型实现，供 dry-run 和测试使用。

pub mod cgroup;
pub mod cluster;
pub mod fake;
pub mod filters;
pub mod injector;
pub mod marking;
pub mod metrics;
pub mod netns;
pub mod network;
pub mod operations;
pub mod resolver;
pub mod tree;
pub mod watchers;

/// 重新导出常用类型，方便使用
pub use cgroup::{Cgroup, ProcCgroup};
pub use cluster::{ClusterClient, KubeClusterClient};
pub use filters::{FilterRegistry, NetworkEndpoint, TcFilter};
pub use injector::{
    Injector, InjectorConfig, InjectorDrivers, InjectorState, NetworkDisruptionInjector,
};
pub use metrics::{MetricsSink, NoopMetrics};
pub use netns::{Netns, ProcNetns};
