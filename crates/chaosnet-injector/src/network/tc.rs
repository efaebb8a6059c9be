//! 流量控制（tc）模块
//!
//! 该模块封装对 qdisc 与过滤器的全部操作。每个添加类操作都作用于一组网卡，
//! 任意一块网卡失败都会立即返回错误，错误信息中包含完整的 tc 命令行。

use std::sync::Arc;
use std::time::Duration;

use chaosnet_common::{ConnState, Protocol, Result};
use ipnet::IpNet;
use tracing::debug;

use super::executor::CommandExecutor;

/// tc 可执行文件
const TC_BIN: &str = "tc";

/// 根 prio qdisc 使用的 priomap（与内核默认值一致，交互类流量进入第 1 个频段）
pub const DEFAULT_PRIOMAP: [u32; 16] = [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

/// netem 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetemParams {
    /// 延迟
    pub delay: Duration,
    /// 延迟抖动
    pub jitter: Duration,
    /// 丢包百分比
    pub drop: u32,
    /// 损坏百分比
    pub corrupt: u32,
    /// 重复百分比
    pub duplicate: u32,
}

/// 过滤器匹配条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterMatch {
    /// 源地址
    pub src_ip: Option<IpNet>,
    /// 目的地址
    pub dst_ip: Option<IpNet>,
    /// 源端口（0 表示不限）
    pub src_port: u16,
    /// 目的端口（0 表示不限）
    pub dst_port: u16,
    /// 协议，必须是 TCP、UDP 或 ARP 之一
    pub protocol: Protocol,
    /// 连接状态
    pub conn_state: ConnState,
}

/// 流量控制器
pub trait TrafficController: Send + Sync {
    /// 添加 prio qdisc；`parent` 为 `root` 时挂在根上
    fn add_prio(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        bands: u32,
        priomap: &[u32; 16],
    ) -> Result<()>;

    /// 添加 netem qdisc
    fn add_netem(&self, ifaces: &[String], parent: &str, handle: u32, params: &NetemParams)
        -> Result<()>;

    /// 添加 tbf qdisc 限制出站带宽
    fn add_output_limit(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        bytes_per_sec: u64,
    ) -> Result<()>;

    /// 添加按地址/端口/协议匹配的过滤器
    fn add_filter(
        &self,
        ifaces: &[String],
        parent: &str,
        priority: u32,
        filter: &FilterMatch,
        flowid: &str,
    ) -> Result<()>;

    /// 添加按 fwmark 匹配的过滤器
    fn add_fw_filter(&self, ifaces: &[String], parent: &str, mark: u32, flowid: &str)
        -> Result<()>;

    /// 按优先级删除网卡上的过滤器
    fn delete_filter(&self, iface: &str, priority: u32) -> Result<()>;

    /// 删除网卡的根 qdisc（连同其下所有类和过滤器）
    fn clear_qdisc(&self, iface: &str) -> Result<()>;

    /// 网卡上是否已经没有注入的根 qdisc
    fn is_qdisc_cleared(&self, iface: &str) -> Result<bool>;
}

/// 基于 tc 命令的流量控制器
pub struct Tc {
    executor: Arc<dyn CommandExecutor>,
}

impl Tc {
    /// 创建流量控制器
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn run(&self, args: Vec<String>) -> Result<String> {
        self.executor.run(TC_BIN, &args)
    }

    /// 对每块网卡执行 `<module> add dev <iface> <parent> [handle N:] <rest>`
    fn add_on_each(
        &self,
        ifaces: &[String],
        module: &str,
        parent: &str,
        handle: Option<String>,
        rest: &[String],
    ) -> Result<()> {
        for iface in ifaces {
            let mut args = vec![module.to_string(), "add".into(), "dev".into(), iface.clone()];
            if parent == "root" {
                args.push("root".into());
            } else {
                args.push("parent".into());
                args.push(parent.to_string());
            }
            if let Some(handle) = &handle {
                args.push("handle".into());
                args.push(handle.clone());
            }
            args.extend(rest.iter().cloned());

            self.run(args)?;
        }

        Ok(())
    }
}

impl TrafficController for Tc {
    fn add_prio(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        bands: u32,
        priomap: &[u32; 16],
    ) -> Result<()> {
        let mut rest = vec!["prio".to_string(), "bands".into(), bands.to_string(), "priomap".into()];
        rest.extend(priomap.iter().map(|band| band.to_string()));

        self.add_on_each(ifaces, "qdisc", parent, Some(format!("{}:", handle)), &rest)
    }

    fn add_netem(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        params: &NetemParams,
    ) -> Result<()> {
        self.add_on_each(
            ifaces,
            "qdisc",
            parent,
            Some(format!("{}:", handle)),
            &netem_args(params),
        )
    }

    fn add_output_limit(
        &self,
        ifaces: &[String],
        parent: &str,
        handle: u32,
        bytes_per_sec: u64,
    ) -> Result<()> {
        // 100ms 的流量作为突发，至少一个 MTU
        let burst = (bytes_per_sec / 10).max(1600);
        let rest = vec![
            "tbf".to_string(),
            "rate".into(),
            format!("{}bps", bytes_per_sec),
            "burst".into(),
            burst.to_string(),
            "latency".into(),
            "50ms".into(),
        ];

        self.add_on_each(ifaces, "qdisc", parent, Some(format!("{}:", handle)), &rest)
    }

    fn add_filter(
        &self,
        ifaces: &[String],
        parent: &str,
        priority: u32,
        filter: &FilterMatch,
        flowid: &str,
    ) -> Result<()> {
        let mut rest = vec!["priority".to_string(), priority.to_string()];
        rest.extend(filter_args(filter, flowid));

        debug!("添加过滤器: priority={} flowid={} match={:?}", priority, flowid, filter);
        self.add_on_each(ifaces, "filter", parent, None, &rest)
    }

    fn add_fw_filter(
        &self,
        ifaces: &[String],
        parent: &str,
        mark: u32,
        flowid: &str,
    ) -> Result<()> {
        let rest = vec![
            "fw".to_string(),
            "flowid".into(),
            flowid.to_string(),
        ];

        self.add_on_each(ifaces, "filter", parent, Some(format!("{:#x}", mark)), &rest)
    }

    fn delete_filter(&self, iface: &str, priority: u32) -> Result<()> {
        self.run(vec![
            "filter".into(),
            "delete".into(),
            "dev".into(),
            iface.to_string(),
            "priority".into(),
            priority.to_string(),
        ])
        .map(|_| ())
    }

    fn clear_qdisc(&self, iface: &str) -> Result<()> {
        self.run(vec![
            "qdisc".into(),
            "del".into(),
            "dev".into(),
            iface.to_string(),
            "root".into(),
        ])
        .map(|_| ())
    }

    fn is_qdisc_cleared(&self, iface: &str) -> Result<bool> {
        let out = self.run(vec![
            "qdisc".into(),
            "show".into(),
            "dev".into(),
            iface.to_string(),
        ])?;

        Ok(!out
            .lines()
            .any(|line| line.trim_start().starts_with("qdisc prio 1: root")))
    }
}

fn netem_args(params: &NetemParams) -> Vec<String> {
    let mut args = vec!["netem".to_string()];

    if !params.delay.is_zero() {
        args.push("delay".into());
        args.push(format!("{}us", params.delay.as_micros()));
        if !params.jitter.is_zero() {
            args.push(format!("{}us", params.jitter.as_micros()));
        }
    }
    if params.drop > 0 {
        args.push("loss".into());
        args.push(format!("{}%", params.drop));
    }
    if params.corrupt > 0 {
        args.push("corrupt".into());
        args.push(format!("{}%", params.corrupt));
    }
    if params.duplicate > 0 {
        args.push("duplicate".into());
        args.push(format!("{}%", params.duplicate));
    }

    args
}

fn filter_args(filter: &FilterMatch, flowid: &str) -> Vec<String> {
    if filter.protocol == Protocol::Arp {
        return vec![
            "protocol".into(),
            "arp".into(),
            "u32".into(),
            "match".into(),
            "u32".into(),
            "0".into(),
            "0".into(),
            "flowid".into(),
            flowid.to_string(),
        ];
    }

    let mut args = vec!["protocol".to_string(), "ip".into()];

    match filter.conn_state.ct_state() {
        Some(ct_state) => {
            args.push("flower".into());
            if let Some(proto) = filter.protocol.ip_proto() {
                args.push("ip_proto".into());
                args.push(if proto == 6 { "tcp" } else { "udp" }.into());
            }
            if let Some(ip) = filter.src_ip {
                args.extend(["src_ip".into(), ip.to_string()]);
            }
            if let Some(ip) = filter.dst_ip {
                args.extend(["dst_ip".into(), ip.to_string()]);
            }
            if filter.src_port != 0 {
                args.extend(["src_port".into(), filter.src_port.to_string()]);
            }
            if filter.dst_port != 0 {
                args.extend(["dst_port".into(), filter.dst_port.to_string()]);
            }
            args.extend(["ct_state".into(), ct_state.to_string()]);
            args.extend(["classid".into(), flowid.to_string()]);
        }
        None => {
            args.push("u32".into());
            if let Some(proto) = filter.protocol.ip_proto() {
                args.extend(["match".into(), "ip".into(), "protocol".into()]);
                args.extend([proto.to_string(), "0xff".into()]);
            }
            if let Some(ip) = filter.src_ip {
                args.extend(["match".into(), "ip".into(), "src".into(), ip.to_string()]);
            }
            if let Some(ip) = filter.dst_ip {
                args.extend(["match".into(), "ip".into(), "dst".into(), ip.to_string()]);
            }
            if filter.src_port != 0 {
                args.extend(["match".into(), "ip".into(), "sport".into()]);
                args.extend([filter.src_port.to_string(), "0xffff".into()]);
            }
            if filter.dst_port != 0 {
                args.extend(["match".into(), "ip".into(), "dport".into()]);
                args.extend([filter.dst_port.to_string(), "0xffff".into()]);
            }
            args.extend(["flowid".into(), flowid.to_string()]);
        }
    }

    args
}
