//! 主机监听器
//!
//! 每隔 `HostResolveInterval` 重新解析一次配置的主机。解析出的地址集合在数量或成员上
//! 与已安装过滤器不一致时，删除该主机的全部过滤器并重新安装。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chaosnet_common::{HostSpec, Result};
use ipnet::IpNet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WatcherContext;
use crate::filters::{FilterRegistry, FilterSpec, NetworkEndpoint, TcFilter};
use crate::netns::with_netns;
use crate::network::DnsClient;
use crate::resolver::resolve_host;
use crate::tree::DISRUPTED_FLOWID;

/// 默认的主机重新解析间隔
pub const DEFAULT_HOST_RESOLVE_INTERVAL: Duration = Duration::from_secs(60);

/// 为主机的每个解析结果生成一条过滤器
pub fn host_filter_specs(host: &HostSpec, networks: &[IpNet]) -> Vec<FilterSpec> {
    networks
        .iter()
        .map(|ip| FilterSpec {
            endpoint: NetworkEndpoint::new(*ip, host.port, host.protocol),
            flow: host.flow,
            conn_state: host.conn_state,
        })
        .collect()
}

/// 解析并安装一组主机的过滤器，返回每个主机登记的过滤器
pub fn install_hosts(
    registry: &FilterRegistry,
    dns: &dyn DnsClient,
    hosts: &[HostSpec],
    interfaces: &[String],
    flowid: &str,
) -> Result<HashMap<HostSpec, Vec<TcFilter>>> {
    let mut installed: HashMap<HostSpec, Vec<TcFilter>> = HashMap::new();

    for host in hosts {
        let networks = resolve_host(dns, &host.host)?;
        let filters = installed.entry(host.clone()).or_default();
        registry.add_filters(filters, host_filter_specs(host, &networks), interfaces, flowid)?;
        info!("主机 {} 解析为 {:?}，已安装过滤器", host.host, networks);
    }

    Ok(installed)
}

/// 主机监听器
pub struct HostsWatcher {
    ctx: WatcherContext,
    dns: Arc<dyn DnsClient>,
    interval: Duration,
    hosts: HashMap<HostSpec, Vec<TcFilter>>,
}

impl HostsWatcher {
    /// 创建主机监听器；`hosts` 为注入时已经安装的过滤器
    pub fn new(
        ctx: WatcherContext,
        dns: Arc<dyn DnsClient>,
        interval: Duration,
        hosts: HashMap<HostSpec, Vec<TcFilter>>,
    ) -> Self {
        Self {
            ctx,
            dns,
            interval,
            hosts,
        }
    }

    /// 主机当前登记的过滤器
    pub fn filters(&self, host: &HostSpec) -> Option<&[TcFilter]> {
        self.hosts.get(host).map(Vec::as_slice)
    }

    /// 周期性刷新，直到被取消
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("主机监听器启动，共 {} 个主机，间隔 {:?}", self.hosts.len(), self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即完成，初始过滤器已在注入时安装
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh();
                }
            }
        }

        info!("主机监听器已停止");
    }

    /// 重新解析全部主机，返回重新安装了过滤器的主机数
    pub fn refresh(&mut self) -> usize {
        let mut reinstalled = 0;
        let interfaces = self.ctx.interfaces.clone();

        for (host, filters) in self.hosts.iter_mut() {
            let registry = &self.ctx.registry;
            let dns = self.dns.as_ref();

            let result = with_netns(self.ctx.netns.as_ref(), || {
                let networks = resolve_host(dns, &host.host)?;
                if !differs(filters, &networks) {
                    return Ok(false);
                }

                registry.remove_all(filters, &interfaces)?;
                registry.add_filters(
                    filters,
                    host_filter_specs(host, &networks),
                    &interfaces,
                    DISRUPTED_FLOWID,
                )?;
                info!("主机 {} 的解析结果已变化: {:?}", host.host, networks);
                Ok(true)
            });

            match result {
                Ok(true) => reinstalled += 1,
                Ok(false) => debug!("主机 {} 的解析结果未变化", host.host),
                Err(e) if e.is_resolution() => {
                    warn!("解析主机 {} 失败，本轮跳过: {}", host.host, e);
                }
                Err(e) => error!("更新主机 {} 的过滤器失败: {}", host.host, e),
            }
        }

        reinstalled
    }
}

fn differs(filters: &[TcFilter], networks: &[IpNet]) -> bool {
    filters.len() != networks.len()
        || networks
            .iter()
            .any(|ip| !filters.iter().any(|f| f.endpoint().ip == *ip))
}
