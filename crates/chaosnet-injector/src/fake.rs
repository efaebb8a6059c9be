//! 记录型后端
//!
//! 这些实现不触碰内核或集群，只记录调用并维护一份内存中的状态，
//! 用于 dry-run 和单元测试。

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chaosnet_common::{Error, Result};
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::WatchEvent;
use kube::ResourceExt;
use tracing::info;

use crate::cluster::{ClusterClient, WatchStream};
use crate::netns::Netns;
use crate::network::{DnsClient, FilterMatch, Link, NetemParams, NetlinkAdapter, Route, TrafficController};

/// 不切换命名空间，只统计进入/退出次数
#[derive(Debug, Default)]
pub struct RecordingNetns {
    enters: AtomicUsize,
    exits: AtomicUsize,
    inaccessible: AtomicBool,
}

impl RecordingNetns {
    /// 进入次数
    pub fn enters(&self) -> usize {
        self.enters.load(Ordering::SeqCst)
    }

    /// 退出次数
    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    /// 当前是否处于命名空间内
    pub fn is_inside(&self) -> bool {
        self.enters() > self.exits()
    }

    /// 模拟命名空间已经消失
    pub fn set_inaccessible(&self, inaccessible: bool) {
        self.inaccessible.store(inaccessible, Ordering::SeqCst);
    }
}

impl Netns for RecordingNetns {
    fn enter(&self) -> Result<()> {
        if self.inaccessible.load(Ordering::SeqCst) {
            return Err(Error::State("网络命名空间已不存在".into()));
        }
        self.enters.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        self.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 记录的 tc 调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcCall {
    AddPrio {
        ifaces: Vec<String>,
        parent: String,
        handle: u32,
        bands: u32,
    },
    AddNetem {
        ifaces: Vec<String>,
        parent: String,
        handle: u32,
        params: NetemParams,
    },
    AddOutputLimit {
        ifaces: Vec<String>,
        parent: String,
        handle: u32,
        bytes_per_sec: u64,
    },
    AddFilter {
        ifaces: Vec<String>,
        parent: String,
        priority: u32,
        filter: FilterMatch,
        flowid: String,
    },
    AddFwFilter {
        ifaces: Vec<String>,
        parent: String,
        mark: u32,
        flowid: String,
    },
    DeleteFilter {
        iface: String,
        priority: u32,
    },
    ClearQdisc {
        iface: String,
    },
}

#[derive(Debug, Default)]
struct TcState {
    calls: Vec<TcCall>,
    // 每块网卡上存活的过滤器优先级，一条内核过滤器一项
    filters: HashMap<String, Vec<u32>>,
    roots: HashMap<String, bool>,
    // (操作名, 还要放行的次数)
    fail_on: Option<(String, usize)>,
}

impl TcState {
    fn check_failure(&mut self, op: &str) -> Result<()> {
        if let Some((target, skip)) = self.fail_on.as_mut() {
            if target.as_str() == op {
                if *skip == 0 {
                    self.fail_on = None;
                    return Err(Error::kernel(op, "fake", "injected failure"));
                }
                *skip -= 1;
            }
        }
        Ok(())
    }
}

/// 内存中的流量控制器
#[derive(Debug, Default)]
pub struct FakeTc {
    state: Mutex<TcState>,
}

impl FakeTc {
    fn state(&self) -> std::sync::MutexGuard<'_, TcState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 所有调用
    pub fn calls(&self) -> Vec<TcCall> {
        self.state().calls.clone()
    }

    /// 所有 add_filter 调用：(网卡, 优先级, 匹配条件, flowid)
    pub fn added_filters(&self) -> Vec<(Vec<String>, u32, FilterMatch, String)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TcCall::AddFilter {
                    ifaces,
                    priority,
                    filter,
                    flowid,
                    ..
                } => Some((ifaces.clone(), *priority, *filter, flowid.clone())),
                _ => None,
            })
            .collect()
    }

    /// 所有 add_netem 调用
    pub fn netem_calls(&self) -> Vec<TcCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, TcCall::AddNetem { .. }))
            .cloned()
            .collect()
    }

    /// 所有被删除的过滤器优先级（按网卡重复）
    pub fn deleted_priorities(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TcCall::DeleteFilter { priority, .. } => Some(*priority),
                _ => None,
            })
            .collect()
    }

    /// 网卡上存活的内核过滤器数量
    pub fn filter_count(&self, iface: &str) -> usize {
        self.state().filters.get(iface).map(Vec::len).unwrap_or(0)
    }

    /// 让下一次指定操作失败
    pub fn fail_next(&self, op: &str) {
        self.fail_on(op, 1);
    }

    /// 让指定操作的第 `nth` 次调用失败（从 1 开始计数）
    pub fn fail_on(&self, op: &str, nth: usize) {
        self.state().fail_on = Some((op.to_string(), nth.saturating_sub(1)));
    }

    fn record(&self, op: &str, call: TcCall) -> Result<()> {
        let mut state = self.state();
        state.check_failure(op)?;
        state.calls.push(call);
        Ok(())
    }
}

impl TrafficController for FakeTc {
    fn add_prio(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        bands: u32,
        _priomap: &[u32; 16],
    ) -> Result<()> {
        self.record(
            "add_prio",
            TcCall::AddPrio {
                ifaces: ifaces.to_vec(),
                parent: parent.to_string(),
                handle,
                bands,
            },
        )?;

        if parent == "root" {
            let mut state = self.state();
            for iface in ifaces {
                state.roots.insert(iface.clone(), true);
            }
        }
        Ok(())
    }

    fn add_netem(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        params: &NetemParams,
    ) -> Result<()> {
        self.record(
            "add_netem",
            TcCall::AddNetem {
                ifaces: ifaces.to_vec(),
                parent: parent.to_string(),
                handle,
                params: *params,
            },
        )
    }

    fn add_output_limit(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        bytes_per_sec: u64,
    ) -> Result<()> {
        self.record(
            "add_output_limit",
            TcCall::AddOutputLimit {
                ifaces: ifaces.to_vec(),
                parent: parent.to_string(),
                handle,
                bytes_per_sec,
            },
        )
    }

    fn add_filter(
        &self,
        ifaces: &[String],
        parent: &str,
        priority: u32,
        filter: &FilterMatch,
        flowid: &str,
    ) -> Result<()> {
        self.record(
            "add_filter",
            TcCall::AddFilter {
                ifaces: ifaces.to_vec(),
                parent: parent.to_string(),
                priority,
                filter: *filter,
                flowid: flowid.to_string(),
            },
        )?;

        let mut state = self.state();
        for iface in ifaces {
            state.filters.entry(iface.clone()).or_default().push(priority);
        }
        Ok(())
    }

    fn add_fw_filter(
        &self,
        ifaces: &[String],
        parent: &str,
        mark: u32,
        flowid: &str,
    ) -> Result<()> {
        self.record(
            "add_fw_filter",
            TcCall::AddFwFilter {
                ifaces: ifaces.to_vec(),
                parent: parent.to_string(),
                mark,
                flowid: flowid.to_string(),
            },
        )
    }

    fn delete_filter(&self, iface: &str, priority: u32) -> Result<()> {
        self.record(
            "delete_filter",
            TcCall::DeleteFilter {
                iface: iface.to_string(),
                priority,
            },
        )?;

        if let Some(filters) = self.state().filters.get_mut(iface) {
            filters.retain(|p| *p != priority);
        }
        Ok(())
    }

    fn clear_qdisc(&self, iface: &str) -> Result<()> {
        self.record(
            "clear_qdisc",
            TcCall::ClearQdisc {
                iface: iface.to_string(),
            },
        )?;

        let mut state = self.state();
        state.roots.remove(iface);
        state.filters.remove(iface);
        Ok(())
    }

    fn is_qdisc_cleared(&self, iface: &str) -> Result<bool> {
        Ok(!self.state().roots.contains_key(iface))
    }
}

/// 内存中的网卡与路由
#[derive(Debug, Default)]
pub struct FakeNetlink {
    links: Mutex<Vec<Link>>,
    routes: Vec<Route>,
    txqlen_calls: Mutex<Vec<(String, u32)>>,
}

impl FakeNetlink {
    /// 以 (名称, 发送队列长度) 列表创建
    pub fn with_links(links: &[(&str, u32)]) -> Self {
        let links = links
            .iter()
            .enumerate()
            .map(|(idx, (name, qlen))| Link {
                name: name.to_string(),
                index: idx as u32 + 1,
                tx_queue_len: *qlen,
            })
            .collect();

        Self {
            links: Mutex::new(links),
            ..Default::default()
        }
    }

    /// 设置默认网关
    pub fn with_gateway(mut self, gateway: Ipv4Addr, device: &str) -> Self {
        self.routes.push(Route {
            gateway: Some(gateway),
            device: device.to_string(),
        });
        self
    }

    /// 所有 set_tx_qlen 调用
    pub fn txqlen_calls(&self) -> Vec<(String, u32)> {
        self.txqlen_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl NetlinkAdapter for FakeNetlink {
    fn link_list(&self) -> Result<Vec<Link>> {
        Ok(self.links.lock().map(|l| l.clone()).unwrap_or_default())
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.link_list()?
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::kernel("link_by_name", name, "网卡不存在"))
    }

    fn default_routes(&self) -> Result<Vec<Route>> {
        Ok(self.routes.clone())
    }

    fn set_tx_qlen(&self, name: &str, qlen: u32) -> Result<()> {
        if let Ok(mut calls) = self.txqlen_calls.lock() {
            calls.push((name.to_string(), qlen));
        }
        if let Ok(mut links) = self.links.lock() {
            if let Some(link) = links.iter_mut().find(|l| l.name == name) {
                link.tx_queue_len = qlen;
            }
        }
        Ok(())
    }
}

/// 内存中的 DNS 记录
#[derive(Debug, Default)]
pub struct FakeDns {
    records: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
}

impl FakeDns {
    /// 设置域名的解析结果
    pub fn set(&self, host: &str, ips: &[Ipv4Addr]) {
        if let Ok(mut records) = self.records.lock() {
            records.insert(host.to_string(), ips.to_vec());
        }
    }
}

impl DnsClient for FakeDns {
    fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Resolution("DNS 记录不可用".into()))?;

        match records.get(host) {
            Some(ips) if !ips.is_empty() => Ok(ips.clone()),
            _ => Err(Error::Resolution(format!("{} 没有 IPv4 记录", host))),
        }
    }
}

type EventSender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>>>;
type EventReceiver<K> = mpsc::UnboundedReceiver<Result<WatchEvent<K>>>;

/// 内存中的集群
#[derive(Default)]
pub struct FakeCluster {
    services: Mutex<HashMap<String, Service>>,
    pods: Mutex<Vec<Pod>>,
    service_watch: Mutex<Option<EventReceiver<Service>>>,
    pod_watch: Mutex<Option<EventReceiver<Pod>>>,
    watch_calls: AtomicUsize,
}

impl FakeCluster {
    /// 添加或替换服务
    pub fn put_service(&self, service: Service) {
        let key = format!("{}/{}", service.namespace().unwrap_or_default(), service.name_any());
        if let Ok(mut services) = self.services.lock() {
            services.insert(key, service);
        }
    }

    /// 替换全部 Pod
    pub fn set_pods(&self, pods: Vec<Pod>) {
        if let Ok(mut current) = self.pods.lock() {
            *current = pods;
        }
    }

    /// 为下一次服务监听准备事件通道
    pub fn service_events(&self) -> EventSender<Service> {
        let (tx, rx) = mpsc::unbounded();
        if let Ok(mut slot) = self.service_watch.lock() {
            *slot = Some(rx);
        }
        tx
    }

    /// 为下一次 Pod 监听准备事件通道
    pub fn pod_events(&self) -> EventSender<Pod> {
        let (tx, rx) = mpsc::unbounded();
        if let Ok(mut slot) = self.pod_watch.lock() {
            *slot = Some(rx);
        }
        tx
    }

    /// 打开过的监听次数
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }
}

fn selector_matches(pod: &Pod, selector: &str) -> bool {
    let labels = pod.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => false,
        })
}

fn take_stream<K: Send + 'static>(slot: &Mutex<Option<EventReceiver<K>>>) -> WatchStream<K> {
    match slot.lock().ok().and_then(|mut s| s.take()) {
        Some(rx) => rx.boxed(),
        None => futures::stream::pending().boxed(),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let key = format!("{}/{}", namespace, name);
        self.services
            .lock()
            .ok()
            .and_then(|services| services.get(&key).cloned())
            .ok_or_else(|| Error::Kubernetes(format!("服务 {} 不存在", key)))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<(Vec<Pod>, String)> {
        let pods = self
            .pods
            .lock()
            .map(|pods| {
                pods.iter()
                    .filter(|pod| pod.namespace().as_deref() == Some(namespace))
                    .filter(|pod| selector_matches(pod, label_selector))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok((pods, "100".to_string()))
    }

    async fn watch_services(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> Result<WatchStream<Service>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        info!("[fake] 监听服务 {}/{} (rv={})", namespace, name, resource_version);
        Ok(take_stream(&self.service_watch))
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream<Pod>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        info!("[fake] 监听 Pod {} {} (rv={})", namespace, label_selector, resource_version);
        Ok(take_stream(&self.pod_watch))
    }
}
