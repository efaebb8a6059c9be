//! 网络故障注入器
//!
//! 注入器的生命周期为 `Created → Injected → Cleaned`。注入时进入目标网络命名空间，
//! 依次配置报文标记、构建 TC 树、安装初始过滤器，然后退出命名空间并在后台启动监听器；
//! 清理时取消全部监听器，清除 qdisc 与 iptables 规则，必要时重置 net_cls classid。

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaosnet_common::{DisruptionLevel, DisruptionSpec, Error, HostSpec, Result, ServiceSpec};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cgroup::Cgroup;
use crate::cluster::ClusterClient;
use crate::filters::{FilterRegistry, TcFilter};
use crate::marking::{self, MarkingStrategy};
use crate::metrics::MetricsSink;
use crate::netns::{with_netns, Netns};
use crate::network::{DnsClient, IpTables, NetlinkAdapter, TrafficController};
use crate::tree::{apply_operations, TreeContext};
use crate::watchers::hosts::DEFAULT_HOST_RESOLVE_INTERVAL;
use crate::watchers::service::{fetch_snapshot, ServiceSnapshot};
use crate::watchers::{HostsWatcher, ServiceWatcher, WatcherContext};

/// 注入器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectorState {
    Created,
    Injected,
    Cleaned,
}

impl fmt::Display for InjectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectorState::Created => write!(f, "created"),
            InjectorState::Injected => write!(f, "injected"),
            InjectorState::Cleaned => write!(f, "cleaned"),
        }
    }
}

/// 注入配置
#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// 故障规格
    pub spec: DisruptionSpec,
    /// 故障级别
    pub level: DisruptionLevel,
    /// 是否在 Pod 初始化阶段注入（此时不做容器级作用域）
    pub on_init: bool,
    /// 目标所在节点的 IP
    pub node_ip: Option<Ipv4Addr>,
    /// 主机重新解析间隔
    pub host_resolve_interval: Duration,
    /// 全局豁免主机，追加在规格的豁免主机之后
    pub allowed_hosts: Vec<HostSpec>,
}

impl InjectorConfig {
    /// 使用默认参数创建 Pod 级注入配置
    pub fn new(spec: DisruptionSpec) -> Self {
        Self {
            spec,
            level: DisruptionLevel::Pod,
            on_init: false,
            node_ip: None,
            host_resolve_interval: DEFAULT_HOST_RESOLVE_INTERVAL,
            allowed_hosts: Vec::new(),
        }
    }

    fn merged_allowed_hosts(&self) -> Vec<HostSpec> {
        self.spec
            .allowed_hosts
            .iter()
            .chain(self.allowed_hosts.iter())
            .cloned()
            .collect()
    }
}

/// 注入器使用的全部驱动
#[derive(Clone)]
pub struct InjectorDrivers {
    pub tc: Arc<dyn TrafficController>,
    pub netlink: Arc<dyn NetlinkAdapter>,
    pub iptables: Arc<dyn IpTables>,
    pub dns: Arc<dyn DnsClient>,
    pub cgroup: Arc<dyn Cgroup>,
    pub netns: Arc<dyn Netns>,
    /// 只有配置了服务目标时才需要
    pub cluster: Option<Arc<dyn ClusterClient>>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// 注入器接口
#[async_trait]
pub trait Injector: Send {
    /// 注入故障
    async fn inject(&mut self) -> Result<()>;

    /// 清除故障
    async fn clean(&mut self) -> Result<()>;

    /// 当前状态
    fn state(&self) -> InjectorState;
}

/// 基于 tc/iptables 的网络故障注入器
pub struct NetworkDisruptionInjector {
    config: InjectorConfig,
    drivers: InjectorDrivers,
    registry: Arc<FilterRegistry>,
    state: InjectorState,
    cancel: Option<CancellationToken>,
    watchers: Vec<JoinHandle<()>>,
    marking: Option<MarkingStrategy>,
}

impl NetworkDisruptionInjector {
    /// 创建注入器
    pub fn new(config: InjectorConfig, drivers: InjectorDrivers) -> Self {
        let registry = Arc::new(FilterRegistry::new(
            drivers.tc.clone(),
            drivers.metrics.clone(),
        ));

        Self {
            config,
            drivers,
            registry,
            state: InjectorState::Created,
            cancel: None,
            watchers: Vec::new(),
            marking: None,
        }
    }

    /// 正在运行的监听器数量
    pub fn watcher_count(&self) -> usize {
        self.watchers.iter().filter(|w| !w.is_finished()).count()
    }

    /// 注入时使用的报文标记策略
    pub fn marking(&self) -> Option<MarkingStrategy> {
        self.marking
    }

    async fn fetch_services(&self) -> Result<Vec<(ServiceSpec, ServiceSnapshot)>> {
        let services = &self.config.spec.services;
        if services.is_empty() {
            return Ok(Vec::new());
        }

        let Some(cluster) = self.drivers.cluster.as_ref() else {
            return Err(Error::Config(
                "配置了服务目标但没有可用的 Kubernetes 客户端".into(),
            ));
        };

        let mut snapshots = Vec::with_capacity(services.len());
        for service in services {
            let snapshot = fetch_snapshot(cluster.as_ref(), service).await?;
            debug!("服务 {} 当前有 {} 个 Pod", service, snapshot.pods.len());
            snapshots.push((service.clone(), snapshot));
        }
        Ok(snapshots)
    }

    fn spawn_watchers(
        &mut self,
        ctx: WatcherContext,
        service_watchers: Vec<ServiceWatcher>,
        host_filters: HashMap<HostSpec, Vec<TcFilter>>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();

        for watcher in service_watchers {
            self.watchers
                .push(tokio::spawn(watcher.run(cancel.child_token())));
        }

        if !host_filters.is_empty() {
            let watcher = HostsWatcher::new(
                ctx,
                self.drivers.dns.clone(),
                self.config.host_resolve_interval,
                host_filters,
            );
            self.watchers
                .push(tokio::spawn(watcher.run(cancel.child_token())));
        }

        cancel
    }

    fn needs_classid_reset(&self) -> bool {
        match self.marking {
            Some(strategy) => strategy == MarkingStrategy::ClassId,
            // 没有本次注入的记录（例如崩溃后单独执行清理），按当前环境推断
            None => {
                marking::scoping_applies(self.config.level, self.config.on_init)
                    && !self.drivers.cgroup.is_cgroup_v2()
            }
        }
    }
}

#[async_trait]
impl Injector for NetworkDisruptionInjector {
    async fn inject(&mut self) -> Result<()> {
        if self.cancel.is_some() {
            return Err(Error::State(
                "监听器已经在运行，重新注入前必须先清理".into(),
            ));
        }

        let spec = self.config.spec.clone();
        spec.validate()?;
        info!(
            "开始注入网络故障: level={}, on_init={}, 主机 {} 个, 服务 {} 个",
            self.config.level,
            self.config.on_init,
            spec.hosts.len(),
            spec.services.len()
        );

        // 集群查询需要挂起，必须在进入命名空间之前完成
        let snapshots = self.fetch_services().await?;
        let allowed_hosts = self.config.merged_allowed_hosts();

        let drivers = self.drivers.clone();
        let registry = self.registry.clone();
        let level = self.config.level;
        let on_init = self.config.on_init;
        let node_ip = self.config.node_ip;
        let mut applied_marking = None;

        let result = with_netns(drivers.netns.as_ref(), || {
            if spec.needs_conntrack() {
                drivers.iptables.log_conntrack()?;
            }

            applied_marking = marking::apply(
                drivers.cgroup.as_ref(),
                drivers.iptables.as_ref(),
                level,
                on_init,
            )?;

            let tree = apply_operations(&TreeContext {
                tc: drivers.tc.as_ref(),
                netlink: drivers.netlink.as_ref(),
                dns: drivers.dns.as_ref(),
                registry: registry.as_ref(),
                spec: &spec,
                allowed_hosts: &allowed_hosts,
                level,
                scoped: applied_marking.is_some(),
                node_ip,
            })?;

            let ctx = WatcherContext {
                netns: drivers.netns.clone(),
                registry: registry.clone(),
                interfaces: Arc::new(tree.interfaces.clone()),
                metrics: drivers.metrics.clone(),
            };

            let mut service_watchers = Vec::new();
            if let Some(cluster) = drivers.cluster.as_ref() {
                for (service, snapshot) in snapshots {
                    let mut watcher = ServiceWatcher::new(ctx.clone(), cluster.clone(), service);
                    watcher.seed(snapshot)?;
                    service_watchers.push(watcher);
                }
            }

            Ok((ctx, tree, service_watchers))
        });

        self.marking = applied_marking;
        let (ctx, tree, service_watchers) = result.map_err(|e| {
            error!("注入失败，需要执行清理: {}", e);
            e
        })?;

        info!(
            "TC 树构建完成: 网卡 {:?}, 安全过滤器 {} 条, 豁免主机 {} 个",
            tree.interfaces,
            tree.safeguard_filters.len(),
            tree.allowed_filters.len()
        );

        let cancel = self.spawn_watchers(ctx, service_watchers, tree.host_filters);
        self.cancel = Some(cancel);
        self.state = InjectorState::Injected;

        info!("网络故障注入完成，已启动 {} 个监听器", self.watchers.len());
        Ok(())
    }

    async fn clean(&mut self) -> Result<()> {
        info!("开始清理网络故障");

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            debug!("已通知 {} 个监听器停止", self.watchers.len());
        }
        self.watchers.clear();

        let mut errors = Vec::new();
        let drivers = self.drivers.clone();

        let result = with_netns(drivers.netns.as_ref(), || {
            let mut errors = Vec::new();

            match drivers.netlink.link_list() {
                Ok(links) => {
                    for link in links {
                        match drivers.tc.is_qdisc_cleared(&link.name) {
                            Ok(true) => debug!("网卡 {} 的 qdisc 已经清除", link.name),
                            Ok(false) => {
                                if let Err(e) = drivers.tc.clear_qdisc(&link.name) {
                                    errors.push(e);
                                }
                            }
                            Err(e) => errors.push(e),
                        }
                    }
                }
                Err(e) => errors.push(e),
            }

            if let Err(e) = drivers.iptables.clear() {
                errors.push(e);
            }

            Ok(errors)
        });

        match result {
            Ok(mut kernel_errors) => errors.append(&mut kernel_errors),
            Err(e) => errors.push(e),
        }

        if self.needs_classid_reset() {
            if let Err(e) = marking::reset_classid(drivers.cgroup.as_ref()) {
                errors.push(e);
            }
        }

        self.marking = None;
        self.state = InjectorState::Cleaned;

        if errors.is_empty() {
            info!("网络故障清理完成");
        } else {
            warn!("网络故障清理完成，但有 {} 个步骤失败", errors.len());
        }
        Error::aggregate(errors)
    }

    fn state(&self) -> InjectorState {
        self.state
    }
}
