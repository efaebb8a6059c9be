//! Service/Pod 监听器
//!
//! 每个配置的 Kubernetes 服务对应一个监听器，同时监听服务本身和其选择器匹配的 Pod：
//! - 服务 Added/Modified：删除全部服务级过滤器后按新端口重装；Pod 级过滤器按端点做差异同步。
//! - 服务 Deleted：删除监听器登记的全部过滤器。
//! - Pod 没有 IP 时先放入待定列表，等到后续事件带上 IP 后再安装过滤器；IP 变化或被回收时删除旧 IP 的过滤器。
//! - 任意事件处理失败都会触发自修复：删除已登记的过滤器、清空本地状态并重新打开监听。

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chaosnet_common::{Error, Protocol, Result, ServiceSpec};
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::WatchEvent;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{wait_or_cancelled, WatcherContext, WATCH_RETRY_DELAY};
use crate::cluster::{label_selector, ClusterClient, WatchStream};
use crate::filters::{find_filter, FilterSpec, NetworkEndpoint, TcFilter};
use crate::netns::with_netns;
use crate::resolver::host_network;
use crate::tree::DISRUPTED_FLOWID;

/// 注入时获取的服务快照
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    /// 服务对象
    pub service: Service,
    /// 选择器匹配的 Pod
    pub pods: Vec<Pod>,
    /// Pod 列表的 resourceVersion
    pub pods_resource_version: String,
}

/// 获取服务及其后端 Pod
pub async fn fetch_snapshot(client: &dyn ClusterClient, spec: &ServiceSpec) -> Result<ServiceSnapshot> {
    let service = client.get_service(&spec.namespace, &spec.name).await?;
    let selector = service_selector(&service);

    let (pods, pods_resource_version) = if selector.is_empty() {
        (Vec::new(), String::new())
    } else {
        client.list_pods(&spec.namespace, &selector).await?
    };

    Ok(ServiceSnapshot {
        service,
        pods,
        pods_resource_version,
    })
}

/// 没有 ClusterIP 的服务
pub fn is_headless(service: &Service) -> bool {
    match service.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()) {
        None | Some("") | Some("None") => true,
        Some(_) => false,
    }
}

/// 服务的 Pod 标签选择器
pub fn service_selector(service: &Service) -> String {
    service
        .spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .map(label_selector)
        .unwrap_or_default()
}

fn selected_ports<'a>(
    service: &'a Service,
    spec: &'a ServiceSpec,
) -> impl Iterator<Item = &'a ServicePort> + 'a {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .into_iter()
        .flatten()
        .filter(move |port| match u16::try_from(port.port) {
            Ok(number) => spec.selects_port(port.name.as_deref(), number),
            Err(_) => false,
        })
}

fn port_protocol(port: &ServicePort) -> Protocol {
    Protocol::from(port.protocol.clone().unwrap_or_else(|| "TCP".to_string()))
}

/// 服务级过滤器：ClusterIP 加每个选中的服务端口；无头服务没有服务级过滤器
pub fn service_filter_specs(service: &Service, spec: &ServiceSpec) -> Vec<FilterSpec> {
    if is_headless(service) {
        return Vec::new();
    }

    let Some(cluster_ip) = service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
    else {
        warn!("服务 {} 的 ClusterIP 不是 IPv4 地址，跳过服务级过滤器", spec);
        return Vec::new();
    };

    selected_ports(service, spec)
        .filter_map(|port| {
            let number = u16::try_from(port.port).ok()?;
            Some(FilterSpec::egress(NetworkEndpoint::new(
                host_network(cluster_ip),
                number,
                port_protocol(port),
            )))
        })
        .collect()
}

/// Pod 的 IPv4 地址
pub fn pod_ip(pod: &Pod) -> Option<Ipv4Addr> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .and_then(|ip| ip.parse().ok())
}

/// 解析服务端口在某个 Pod 上的目标端口；命名端口在 Pod 的容器端口中查找
fn target_port(port: &ServicePort, pod: &Pod) -> Option<u16> {
    match &port.target_port {
        None => u16::try_from(port.port).ok(),
        Some(IntOrString::Int(number)) => u16::try_from(*number).ok(),
        Some(IntOrString::String(name)) => {
            if let Ok(number) = name.parse::<u16>() {
                return Some(number);
            }

            let resolved = pod
                .spec
                .as_ref()
                .into_iter()
                .flat_map(|s| s.containers.iter())
                .flat_map(|c| c.ports.iter().flatten())
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .and_then(|p| u16::try_from(p.container_port).ok());

            if resolved.is_none() {
                warn!("Pod {} 没有名为 {} 的容器端口", pod.name_any(), name);
            }
            resolved
        }
    }
}

/// Pod 级过滤器：Pod IP 加每个选中端口的目标端口；没有 IP 的 Pod 不产生过滤器
pub fn pod_filter_specs(service: &Service, spec: &ServiceSpec, pod: &Pod) -> Vec<FilterSpec> {
    let Some(ip) = pod_ip(pod) else {
        return Vec::new();
    };

    selected_ports(service, spec)
        .filter_map(|port| {
            let number = target_port(port, pod)?;
            Some(FilterSpec::egress(NetworkEndpoint::new(
                host_network(ip),
                number,
                port_protocol(port),
            )))
        })
        .collect()
}

enum Incoming {
    Service(Option<Result<WatchEvent<Service>>>),
    Pod(Option<Result<WatchEvent<Pod>>>),
}

async fn next_event<K>(stream: &mut Option<WatchStream<K>>) -> Option<Result<WatchEvent<K>>> {
    use futures::StreamExt;

    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// 服务监听器
pub struct ServiceWatcher {
    ctx: WatcherContext,
    client: Arc<dyn ClusterClient>,
    spec: ServiceSpec,
    service: Option<Service>,
    selector: String,
    service_filters: Vec<TcFilter>,
    pod_filters: Vec<TcFilter>,
    // Pod 名称 -> 该 Pod 当前占用的端点
    pod_endpoints: HashMap<String, Vec<NetworkEndpoint>>,
    pending_pods: Vec<String>,
    service_resource_version: String,
    pods_resource_version: String,
    service_stream: Option<WatchStream<Service>>,
    pod_stream: Option<WatchStream<Pod>>,
}

impl ServiceWatcher {
    /// 创建服务监听器
    pub fn new(ctx: WatcherContext, client: Arc<dyn ClusterClient>, spec: ServiceSpec) -> Self {
        Self {
            ctx,
            client,
            spec,
            service: None,
            selector: String::new(),
            service_filters: Vec::new(),
            pod_filters: Vec::new(),
            pod_endpoints: HashMap::new(),
            pending_pods: Vec::new(),
            service_resource_version: String::new(),
            pods_resource_version: String::new(),
            service_stream: None,
            pod_stream: None,
        }
    }

    /// 服务级过滤器
    pub fn service_filters(&self) -> &[TcFilter] {
        &self.service_filters
    }

    /// Pod 级过滤器
    pub fn pod_filters(&self) -> &[TcFilter] {
        &self.pod_filters
    }

    /// 尚未分配 IP 的 Pod
    pub fn pending_pods(&self) -> &[String] {
        &self.pending_pods
    }

    /// 用注入时的快照安装初始过滤器；调用方必须已经处于目标命名空间中
    pub fn seed(&mut self, snapshot: ServiceSnapshot) -> Result<()> {
        self.selector = service_selector(&snapshot.service);
        self.service_resource_version = snapshot.service.resource_version().unwrap_or_default();
        self.pods_resource_version = snapshot.pods_resource_version;

        self.apply_service(&snapshot.service, &snapshot.pods)?;
        info!(
            "服务 {} 已安装 {} 条服务级过滤器和 {} 条 Pod 级过滤器",
            self.spec,
            self.service_filters.len(),
            self.pod_filters.len()
        );

        self.service = Some(snapshot.service);
        Ok(())
    }

    /// 处理监听事件，直到被取消
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("服务监听器启动: {}", self.spec);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.ensure_streams().await {
                warn!("打开服务 {} 的监听失败: {}", self.spec, e);
                if wait_or_cancelled(&cancel, WATCH_RETRY_DELAY).await {
                    break;
                }
                continue;
            }

            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                event = next_event(&mut self.service_stream) => Incoming::Service(event),
                event = next_event(&mut self.pod_stream) => Incoming::Pod(event),
            };

            self.dispatch(incoming).await;
        }

        info!("服务监听器已停止: {}", self.spec);
    }

    async fn ensure_streams(&mut self) -> Result<()> {
        if self.service_stream.is_none() {
            let stream = self
                .client
                .watch_services(&self.spec.namespace, &self.spec.name, &self.service_resource_version)
                .await?;
            debug!("已打开服务 {} 的监听 (rv={})", self.spec, self.service_resource_version);
            self.service_stream = Some(stream);
        }

        if self.pod_stream.is_none() && !self.selector.is_empty() {
            let stream = self
                .client
                .watch_pods(&self.spec.namespace, &self.selector, &self.pods_resource_version)
                .await?;
            debug!("已打开 Pod 监听 {} (rv={})", self.selector, self.pods_resource_version);
            self.pod_stream = Some(stream);
        }

        Ok(())
    }

    async fn dispatch(&mut self, incoming: Incoming) {
        let result = match incoming {
            Incoming::Service(None) => {
                warn!("服务 {} 的监听通道已关闭，将重新打开", self.spec);
                self.service_stream = None;
                Ok(())
            }
            Incoming::Pod(None) => {
                warn!("服务 {} 的 Pod 监听通道已关闭，将重新打开", self.spec);
                self.pod_stream = None;
                Ok(())
            }
            Incoming::Service(Some(event)) => match event {
                Ok(event) => self.handle_service_event(event).await,
                Err(e) => Err(e),
            },
            Incoming::Pod(Some(event)) => event.and_then(|event| self.handle_pod_event(event)),
        };

        if let Err(e) = result {
            self.repair(&e);
        }
    }

    /// 处理服务事件
    pub async fn handle_service_event(&mut self, event: WatchEvent<Service>) -> Result<()> {
        match event {
            WatchEvent::Added(service) | WatchEvent::Modified(service) => {
                if let Some(rv) = service.resource_version() {
                    self.service_resource_version = rv;
                }
                self.sync_service(service).await
            }
            WatchEvent::Deleted(service) => {
                if let Some(rv) = service.resource_version() {
                    self.service_resource_version = rv;
                }
                info!("服务 {} 已被删除，移除全部过滤器", self.spec);
                self.remove_everything()?;
                self.service = None;
                self.selector.clear();
                self.pod_stream = None;
                Ok(())
            }
            WatchEvent::Bookmark(bookmark) => {
                self.service_resource_version = bookmark.metadata.resource_version;
                Ok(())
            }
            WatchEvent::Error(e) => Err(Error::Watch(format!(
                "服务 {} 监听错误: {} ({})",
                self.spec, e.message, e.code
            ))),
        }
    }

    /// 处理 Pod 事件
    pub fn handle_pod_event(&mut self, event: WatchEvent<Pod>) -> Result<()> {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                if let Some(rv) = pod.resource_version() {
                    self.pods_resource_version = rv;
                }
                self.upsert_pod(&pod)
            }
            WatchEvent::Deleted(pod) => {
                if let Some(rv) = pod.resource_version() {
                    self.pods_resource_version = rv;
                }
                self.remove_pod(&pod)
            }
            WatchEvent::Bookmark(bookmark) => {
                self.pods_resource_version = bookmark.metadata.resource_version;
                Ok(())
            }
            WatchEvent::Error(e) => Err(Error::Watch(format!(
                "服务 {} 的 Pod 监听错误: {} ({})",
                self.spec, e.message, e.code
            ))),
        }
    }

    async fn sync_service(&mut self, service: Service) -> Result<()> {
        let selector = service_selector(&service);

        let pods = if selector.is_empty() {
            Vec::new()
        } else {
            let (pods, rv) = self.client.list_pods(&self.spec.namespace, &selector).await?;
            if selector != self.selector {
                self.pod_stream = None;
                self.pods_resource_version = rv;
            }
            pods
        };
        self.selector = selector;

        let netns = self.ctx.netns.clone();
        with_netns(netns.as_ref(), || self.apply_service(&service, &pods))?;

        self.service = Some(service);
        Ok(())
    }

    /// 服务级过滤器整体重装，Pod 级过滤器做差异同步
    fn apply_service(&mut self, service: &Service, pods: &[Pod]) -> Result<()> {
        let registry = self.ctx.registry.clone();
        let interfaces = self.ctx.interfaces.clone();

        registry.remove_all(&mut self.service_filters, &interfaces)?;
        if is_headless(service) {
            debug!("服务 {} 为无头服务，只安装 Pod 级过滤器", self.spec);
        } else {
            registry.add_filters(
                &mut self.service_filters,
                service_filter_specs(service, &self.spec),
                &interfaces,
                DISRUPTED_FLOWID,
            )?;
        }

        let mut desired = Vec::new();
        let mut pending = Vec::new();
        let mut owners = HashMap::new();
        for pod in pods {
            if pod_ip(pod).is_none() {
                pending.push(pod.name_any());
                continue;
            }
            let specs = pod_filter_specs(service, &self.spec, pod);
            owners.insert(pod.name_any(), specs.iter().map(|spec| spec.endpoint).collect());
            desired.extend(specs);
        }

        let outcome = registry.sync(&mut self.pod_filters, desired, &interfaces, DISRUPTED_FLOWID)?;
        debug!(
            "服务 {} 的 Pod 级过滤器: 新增 {}, 删除 {}, 待定 Pod {}",
            self.spec,
            outcome.added,
            outcome.removed,
            pending.len()
        );
        self.pod_endpoints = owners;
        self.pending_pods = pending;

        Ok(())
    }

    /// Pod 新增或变化：按该 Pod 之前占用的端点做差异，IP 变化或被回收时删除旧端点
    fn upsert_pod(&mut self, pod: &Pod) -> Result<()> {
        let Some(service) = self.service.as_ref() else {
            debug!("服务 {} 尚未就绪，忽略 Pod {}", self.spec, pod.name_any());
            return Ok(());
        };
        let name = pod.name_any();

        let desired = if pod_ip(pod).is_some() {
            self.pending_pods.retain(|p| p != &name);
            pod_filter_specs(service, &self.spec, pod)
        } else {
            if !self.pending_pods.contains(&name) {
                debug!("Pod {} 尚未分配 IP，加入待定列表", name);
                self.pending_pods.push(name.clone());
            }
            Vec::new()
        };

        let previous = self.pod_endpoints.remove(&name).unwrap_or_default();
        let stale: Vec<NetworkEndpoint> = previous
            .into_iter()
            .filter(|endpoint| !desired.iter().any(|spec| spec.endpoint == *endpoint))
            .collect();
        let stale = self.releasable(stale);
        let missing: Vec<FilterSpec> = desired
            .iter()
            .filter(|spec| find_filter(&self.pod_filters, &spec.endpoint).is_none())
            .copied()
            .collect();
        if !desired.is_empty() {
            self.pod_endpoints
                .insert(name.clone(), desired.iter().map(|spec| spec.endpoint).collect());
        }
        if stale.is_empty() && missing.is_empty() {
            return Ok(());
        }

        let registry = self.ctx.registry.clone();
        let interfaces = self.ctx.interfaces.clone();
        let netns = self.ctx.netns.clone();
        let (removed, added) = with_netns(netns.as_ref(), || {
            let removed = registry.remove_filters(&mut self.pod_filters, &stale, &interfaces)?;
            let added =
                registry.add_filters(&mut self.pod_filters, missing, &interfaces, DISRUPTED_FLOWID)?;
            Ok((removed, added))
        })?;

        info!("Pod {} 的过滤器已更新: 新增 {}, 删除 {}", name, added, removed);
        Ok(())
    }

    fn remove_pod(&mut self, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        self.pending_pods.retain(|p| p != &name);

        let mut owned = self.pod_endpoints.remove(&name).unwrap_or_default();
        if let Some(service) = self.service.as_ref() {
            for spec in pod_filter_specs(service, &self.spec, pod) {
                if !owned.contains(&spec.endpoint) {
                    owned.push(spec.endpoint);
                }
            }
        }
        let endpoints = self.releasable(owned);
        if endpoints.is_empty() {
            return Ok(());
        }

        let registry = self.ctx.registry.clone();
        let interfaces = self.ctx.interfaces.clone();
        let netns = self.ctx.netns.clone();
        let removed = with_netns(netns.as_ref(), || {
            registry.remove_filters(&mut self.pod_filters, &endpoints, &interfaces)
        })?;

        info!("Pod {} 已删除，移除 {} 条过滤器", name, removed);
        Ok(())
    }

    /// 只保留已安装且不被其他 Pod 占用的端点（Pod IP 可能被新 Pod 复用）
    fn releasable(&self, endpoints: Vec<NetworkEndpoint>) -> Vec<NetworkEndpoint> {
        endpoints
            .into_iter()
            .filter(|endpoint| find_filter(&self.pod_filters, endpoint).is_some())
            .filter(|endpoint| !self.pod_endpoints.values().any(|owned| owned.contains(endpoint)))
            .collect()
    }

    fn remove_everything(&mut self) -> Result<()> {
        let registry = self.ctx.registry.clone();
        let interfaces = self.ctx.interfaces.clone();
        let netns = self.ctx.netns.clone();

        with_netns(netns.as_ref(), || {
            registry.remove_all(&mut self.service_filters, &interfaces)?;
            registry.remove_all(&mut self.pod_filters, &interfaces)?;
            Ok(())
        })?;

        self.pod_endpoints.clear();
        self.pending_pods.clear();
        Ok(())
    }

    /// 自修复：删除登记的过滤器，清空本地状态并关闭监听，下一轮循环会重新打开
    fn repair(&mut self, cause: &Error) {
        error!("服务监听器 {} 处理事件失败，开始自修复: {}", self.spec, cause);

        if let Err(e) = self.remove_everything() {
            error!(
                "自修复时删除过滤器失败，仍登记 {} 条: {}",
                self.service_filters.len() + self.pod_filters.len(),
                e
            );
        }

        self.pod_endpoints.clear();
        self.pending_pods.clear();
        self.service = None;
        self.selector.clear();
        self.service_resource_version.clear();
        self.pods_resource_version.clear();
        self.service_stream = None;
        self.pod_stream = None;

        self.ctx.metrics.watcher_repaired("service");
    }
}
