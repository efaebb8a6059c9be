//! 过滤器登记与差异计算模块
//!
//! 每条内核过滤器在 [`FilterRegistry`] 中都有唯一对应的 [`TcFilter`] 记录。
//! 安装时先写内核再登记，删除时先删内核再注销，保证登记表永远不会丢失对内核对象的跟踪。
//! 比较过滤器时只看 [`NetworkEndpoint`]，与优先级无关。

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chaosnet_common::{ConnState, Flow, Protocol, Result};
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::metrics::MetricsSink;
use crate::network::{FilterMatch, TrafficController};

/// 过滤器优先级计数器的初始值，第一条过滤器的优先级为该值加一
pub const BASE_TC_PRIORITY: u32 = 49149;

/// 所有过滤器都挂在根 prio qdisc 上
pub const ROOT_FILTER_PARENT: &str = "1:0";

/// 过滤器匹配的网络端点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkEndpoint {
    /// 网段
    pub ip: IpNet,
    /// 端口，0 表示不限
    pub port: u16,
    /// 协议
    pub protocol: Protocol,
}

impl NetworkEndpoint {
    /// 创建网络端点
    pub fn new(ip: IpNet, port: u16, protocol: Protocol) -> Self {
        Self { ip, port, protocol }
    }
}

impl fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip={}; port={}; protocol={}",
            self.ip, self.port, self.protocol
        )
    }
}

/// 待安装的过滤器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterSpec {
    /// 匹配端点
    pub endpoint: NetworkEndpoint,
    /// 流向
    pub flow: Flow,
    /// 连接状态
    pub conn_state: ConnState,
}

impl FilterSpec {
    /// 创建不限连接状态的出站过滤器
    pub fn egress(endpoint: NetworkEndpoint) -> Self {
        Self {
            endpoint,
            flow: Flow::Egress,
            conn_state: ConnState::Undefined,
        }
    }

    /// 展开为内核过滤器匹配条件，每个协议变体一条
    fn matches(&self) -> Vec<FilterMatch> {
        let endpoint = self.endpoint;

        endpoint
            .protocol
            .variants()
            .into_iter()
            .map(|protocol| match self.flow {
                Flow::Egress => FilterMatch {
                    src_ip: None,
                    dst_ip: Some(endpoint.ip),
                    src_port: 0,
                    dst_port: endpoint.port,
                    protocol,
                    conn_state: self.conn_state,
                },
                Flow::Ingress => FilterMatch {
                    src_ip: Some(endpoint.ip),
                    dst_ip: None,
                    src_port: endpoint.port,
                    dst_port: 0,
                    protocol,
                    conn_state: self.conn_state,
                },
            })
            .collect()
    }
}

/// 已安装的过滤器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcFilter {
    /// 安装参数
    pub spec: FilterSpec,
    /// 内核优先级，同时用作删除句柄
    pub priority: u32,
}

impl TcFilter {
    /// 匹配端点
    pub fn endpoint(&self) -> &NetworkEndpoint {
        &self.spec.endpoint
    }
}

/// 按端点查找过滤器
pub fn find_filter(filters: &[TcFilter], endpoint: &NetworkEndpoint) -> Option<usize> {
    filters.iter().position(|f| f.endpoint() == endpoint)
}

/// 一次同步的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    /// 新安装的过滤器数
    pub added: usize,
    /// 删除的过滤器数
    pub removed: usize,
}

/// 过滤器登记表
///
/// 持有优先级计数器；同一个注入器的所有监听器共享同一个登记表。
pub struct FilterRegistry {
    tc: Arc<dyn TrafficController>,
    metrics: Arc<dyn MetricsSink>,
    priority: AtomicU32,
}

impl FilterRegistry {
    /// 创建登记表
    pub fn new(tc: Arc<dyn TrafficController>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            tc,
            metrics,
            priority: AtomicU32::new(BASE_TC_PRIORITY),
        }
    }

    /// 分配下一个优先级（单调递增，从不复用）
    pub fn next_priority(&self) -> u32 {
        self.priority.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 安装过滤器并登记到 `installed`，每装好一条立即登记
    ///
    /// 某条失败时先删掉它已下发的内核过滤器再返回错误，之前装好的仍保留在列表中。
    pub fn add_filters(
        &self,
        installed: &mut Vec<TcFilter>,
        specs: impl IntoIterator<Item = FilterSpec>,
        interfaces: &[String],
        flowid: &str,
    ) -> Result<usize> {
        let mut added = 0;

        for spec in specs {
            let priority = self.next_priority();

            for filter in spec.matches() {
                if let Err(e) =
                    self.tc
                        .add_filter(interfaces, ROOT_FILTER_PARENT, priority, &filter, flowid)
                {
                    self.rollback(priority, interfaces);
                    if added > 0 {
                        self.metrics.filters_installed(added);
                    }
                    return Err(e);
                }
            }

            debug!("已安装过滤器 {} (priority={}, flowid={})", spec.endpoint, priority, flowid);
            installed.push(TcFilter { spec, priority });
            added += 1;
        }

        if added > 0 {
            self.metrics.filters_installed(added);
        }
        Ok(added)
    }

    // 同一优先级下已经装上的协议变体和网卡没有登记，必须当场删掉
    fn rollback(&self, priority: u32, interfaces: &[String]) {
        for iface in interfaces {
            if let Err(e) = self.tc.delete_filter(iface, priority) {
                warn!("回滚网卡 {} 上的过滤器 (priority={}) 失败: {}", iface, priority, e);
            }
        }
    }

    /// 删除过滤器：先在每块网卡上按优先级删除内核过滤器，再从 `installed` 中注销
    pub fn remove_filters(
        &self,
        installed: &mut Vec<TcFilter>,
        to_remove: &[NetworkEndpoint],
        interfaces: &[String],
    ) -> Result<usize> {
        let mut removed = 0;

        for endpoint in to_remove {
            let Some(idx) = find_filter(installed, endpoint) else {
                continue;
            };
            let priority = installed[idx].priority;

            for iface in interfaces {
                self.tc.delete_filter(iface, priority)?;
            }

            installed.remove(idx);
            debug!("已删除过滤器 {} (priority={})", endpoint, priority);
            removed += 1;
        }

        if removed > 0 {
            self.metrics.filters_removed(removed);
        }
        Ok(removed)
    }

    /// 删除登记的全部过滤器
    pub fn remove_all(&self, installed: &mut Vec<TcFilter>, interfaces: &[String]) -> Result<usize> {
        let endpoints: Vec<NetworkEndpoint> = installed.iter().map(|f| *f.endpoint()).collect();
        self.remove_filters(installed, &endpoints, interfaces)
    }

    /// 使已安装集合与期望集合一致：删除多余的端点，安装缺少的端点，已存在的保持不动
    pub fn sync(
        &self,
        installed: &mut Vec<TcFilter>,
        desired: Vec<FilterSpec>,
        interfaces: &[String],
        flowid: &str,
    ) -> Result<SyncOutcome> {
        let stale: Vec<NetworkEndpoint> = installed
            .iter()
            .map(|f| *f.endpoint())
            .filter(|endpoint| !desired.iter().any(|d| d.endpoint == *endpoint))
            .collect();

        let mut missing: Vec<FilterSpec> = Vec::new();
        for spec in desired {
            let known = find_filter(installed, &spec.endpoint).is_some()
                || missing.iter().any(|m| m.endpoint == spec.endpoint);
            if !known {
                missing.push(spec);
            }
        }

        let removed = self.remove_filters(installed, &stale, interfaces)?;
        let added = self.add_filters(installed, missing, interfaces, flowid)?;

        if added > 0 || removed > 0 {
            info!("过滤器同步完成: 新增 {}, 删除 {}", added, removed);
        }
        Ok(SyncOutcome { added, removed })
    }
}
