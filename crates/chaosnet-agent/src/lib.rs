//! ChaosNet Agent - 网络故障注入守护进程
//!
//! 该模块根据配置组装注入引擎的各个驱动（tc、iproute2、iptables、cgroup、
//! 网络命名空间、Kubernetes 客户端），驱动一次完整的注入/等待/清理生命周期，
//! 并导出 Prometheus 指标。

pub mod config;
pub mod logging;
pub mod metrics;

use anyhow::{anyhow, Context, Result};
use chaosnet_common::{DisruptionLevel, DisruptionSpec};
use chaosnet_injector::fake::RecordingNetns;
use chaosnet_injector::network::{
    CommandExecutor, DryRunExecutor, IpRoute2, IpTablesCmd, SystemDnsClient, SystemExecutor, Tc,
};
use chaosnet_injector::{
    ClusterClient, Injector, InjectorConfig, InjectorDrivers, InjectorState, KubeClusterClient,
    Netns, NetworkDisruptionInjector, ProcCgroup, ProcNetns,
};
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::metrics::PrometheusMetrics;

/// 注入目标
#[derive(Debug, Clone)]
pub struct Target {
    /// 目标进程 PID，用于定位网络命名空间和 cgroup
    pub pid: u32,
    /// 故障级别
    pub level: DisruptionLevel,
    /// 是否在 Pod 初始化阶段注入
    pub on_init: bool,
    /// 目标所在节点的 IP
    pub node_ip: Option<Ipv4Addr>,
}

/// 从 YAML 或 JSON 文件读取故障规格
pub fn load_spec(path: &Path) -> Result<DisruptionSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取故障规格文件: {:?}", path))?;

    let spec = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content).context("故障规格格式错误")?,
        Some("json") => serde_json::from_str(&content).context("故障规格格式错误")?,
        _ => return Err(anyhow!("不支持的故障规格文件格式，仅支持 YAML 或 JSON")),
    };

    Ok(spec)
}

/// Agent 主结构体
pub struct Agent {
    /// 配置
    config: AgentConfig,
    /// 指标收集器
    metrics: Arc<PrometheusMetrics>,
    /// 注入器
    injector: NetworkDisruptionInjector,
}

impl Agent {
    /// 创建新的 Agent 实例
    pub async fn new(config: AgentConfig, target: Target, spec: DisruptionSpec) -> Result<Self> {
        let metrics = Arc::new(PrometheusMetrics::new().context("创建指标收集器失败")?);
        let drivers = build_drivers(&config, &target, &spec, metrics.clone()).await?;

        let injector_config = InjectorConfig {
            spec,
            level: target.level,
            on_init: target.on_init,
            node_ip: target.node_ip,
            host_resolve_interval: config.network_disruption.host_resolve_interval(),
            allowed_hosts: config.network_disruption.allowed_hosts.clone(),
        };

        Ok(Self {
            config,
            metrics,
            injector: NetworkDisruptionInjector::new(injector_config, drivers),
        })
    }

    /// 启动指标服务器（如果启用）
    pub fn start_metrics_server(&self) -> Result<()> {
        if !self.config.metrics.enabled {
            return Ok(());
        }

        let addr = self.config.metrics.socket_addr()?;
        self.metrics.start_metrics_server(addr);
        Ok(())
    }

    /// 注入故障
    pub async fn inject(&mut self) -> Result<()> {
        let result = self.injector.inject().await;
        self.metrics.record_injection(result.is_ok());
        result.context("注入网络故障失败")
    }

    /// 清除故障
    pub async fn clean(&mut self) -> Result<()> {
        let result = self.injector.clean().await;
        self.metrics.record_clean(result.is_ok());
        result.context("清理网络故障失败")
    }

    /// 注入后等待 `shutdown` 完成再清理；注入失败时同样执行清理
    pub async fn run(&mut self, shutdown: impl Future<Output = Result<()>>) -> Result<()> {
        if let Err(e) = self.inject().await {
            error!("{:#}", e);
            if let Err(clean_err) = self.clean().await {
                error!("注入失败后的清理也失败: {:#}", clean_err);
            }
            return Err(e);
        }

        info!("故障已生效，等待退出信号");
        if let Err(e) = shutdown.await {
            warn!("等待退出信号失败，立即清理: {:#}", e);
        }

        self.clean().await
    }

    /// 注入器当前状态
    pub fn state(&self) -> InjectorState {
        self.injector.state()
    }
}

async fn build_drivers(
    config: &AgentConfig,
    target: &Target,
    spec: &DisruptionSpec,
    metrics: Arc<PrometheusMetrics>,
) -> Result<InjectorDrivers> {
    let executor: Arc<dyn CommandExecutor> = if config.dry_run {
        info!("dry-run 模式：只记录修改类命令");
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(SystemExecutor)
    };

    let netns: Arc<dyn Netns> = if config.dry_run {
        Arc::new(RecordingNetns::default())
    } else {
        Arc::new(
            ProcNetns::new(&config.mount_proc, target.pid)
                .with_context(|| format!("无法打开进程 {} 的网络命名空间", target.pid))?,
        )
    };

    let cgroup = ProcCgroup::new(&config.mount_proc, &config.mount_cgroup, target.pid, config.dry_run)
        .with_context(|| format!("无法读取进程 {} 的 cgroup", target.pid))?;

    let cluster: Option<Arc<dyn ClusterClient>> = if spec.services.is_empty() {
        None
    } else {
        let client = KubeClusterClient::try_default()
            .await
            .context("无法创建 Kubernetes 客户端")?;
        Some(Arc::new(client))
    };

    Ok(InjectorDrivers {
        tc: Arc::new(Tc::new(executor.clone())),
        netlink: Arc::new(IpRoute2::new(executor.clone())),
        iptables: Arc::new(IpTablesCmd::new(executor)),
        dns: Arc::new(SystemDnsClient),
        cgroup: Arc::new(cgroup),
        netns,
        cluster,
        metrics,
    })
}

/// 等待 SIGINT 或 SIGTERM
pub async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("无法监听 SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("无法监听 SIGTERM")?;

    tokio::select! {
        _ = interrupt.recv() => info!("收到 SIGINT"),
        _ = terminate.recv() => info!("收到 SIGTERM"),
    }

    Ok(())
}
