//! TC 树构建模块
//!
//! 在命名空间内的每块网卡上构建如下结构：
//!
//! ```text
//! root (1:)  prio，4 个频段
//!  ├─ 1:1  安全通道与豁免流量，不受扰动
//!  ├─ 1:2, 1:3
//!  └─ 1:4  候选扰动频段
//!      └─ 2:  prio，2 个频段（仅容器级作用域）
//!          ├─ 2:1  未标记流量
//!          └─ 2:2  已标记流量，扰动操作挂在这里
//! ```
//!
//! 安全过滤器最先安装，因此优先级数值最小，在所有目标过滤器之前匹配。

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chaosnet_common::{
    DisruptionLevel, DisruptionSpec, Error, Flow, HostSpec, Protocol, Result,
};
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::filters::{FilterRegistry, FilterSpec, NetworkEndpoint, TcFilter};
use crate::marking::INJECTOR_CGROUP_CLASSID;
use crate::network::{DnsClient, Link, NetlinkAdapter, TrafficController, DEFAULT_PRIOMAP};
use crate::operations::LinkOperation;
use crate::resolver::{host_network, WILDCARD_NETWORK};
use crate::watchers::hosts::install_hosts;

/// 不受扰动的频段
pub const SAFE_FLOWID: &str = "1:1";

/// 候选扰动频段
pub const DISRUPTED_FLOWID: &str = "1:4";

/// 已标记流量的频段
pub const MARKED_FLOWID: &str = "2:2";

/// 根 prio qdisc 的频段数
pub const ROOT_BANDS: u32 = 4;

/// 发送队列长度为 0 的网卡在构建期间临时使用的长度
const ACTIVE_TX_QUEUE_LEN: u32 = 1000;

/// 云厂商元数据服务地址
const METADATA_SERVICE_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

const SSH_PORT: u16 = 22;

/// 构建 TC 树所需的驱动和参数
pub struct TreeContext<'a> {
    pub tc: &'a dyn TrafficController,
    pub netlink: &'a dyn NetlinkAdapter,
    pub dns: &'a dyn DnsClient,
    pub registry: &'a FilterRegistry,
    pub spec: &'a DisruptionSpec,
    /// 规格中的豁免主机与全局豁免主机的合集
    pub allowed_hosts: &'a [HostSpec],
    pub level: DisruptionLevel,
    /// 是否把扰动限定在单个容器的已标记流量上
    pub scoped: bool,
    /// 目标所在节点的 IP（Pod 级安全通道）
    pub node_ip: Option<Ipv4Addr>,
}

/// 构建完成的树
#[derive(Debug, Default)]
pub struct BuiltTree {
    /// 命名空间内的全部网卡
    pub interfaces: Vec<String>,
    /// 安全过滤器
    pub safeguard_filters: Vec<TcFilter>,
    /// 豁免主机的过滤器
    pub allowed_filters: HashMap<HostSpec, Vec<TcFilter>>,
    /// 没有配置目标时的全量过滤器
    pub catch_all_filters: Vec<TcFilter>,
    /// 目标主机的过滤器，交给主机监听器继续维护
    pub host_filters: HashMap<HostSpec, Vec<TcFilter>>,
}

/// 构建 qdisc 树并安装初始过滤器；任何一步失败都会中止构建
pub fn apply_operations(ctx: &TreeContext<'_>) -> Result<BuiltTree> {
    // 没有节点安全通道时扰动可能切断节点与 Pod 的连接
    if ctx.level == DisruptionLevel::Pod && ctx.node_ip.is_none() {
        return Err(Error::Config(
            "Pod 级注入必须提供目标 Pod 所在节点的 IP (TARGET_POD_HOST_IP)".into(),
        ));
    }

    let links = ctx.netlink.link_list()?;
    let interfaces: Vec<String> = links.iter().map(|l| l.name.clone()).collect();
    info!("在网卡 {:?} 上构建 TC 树", interfaces);

    let mut raised = Vec::new();
    let result = raise_tx_queues(ctx.netlink, &links, &mut raised).and_then(|_| build(ctx, interfaces));

    for name in &raised {
        if let Err(e) = ctx.netlink.set_tx_qlen(name, 0) {
            warn!("恢复网卡 {} 的发送队列长度失败: {}", name, e);
        }
    }

    result
}

/// prio qdisc 在发送队列长度为 0 的网卡上会丢弃流量
fn raise_tx_queues(
    netlink: &dyn NetlinkAdapter,
    links: &[Link],
    raised: &mut Vec<String>,
) -> Result<()> {
    for link in links.iter().filter(|l| l.tx_queue_len == 0) {
        debug!("临时把网卡 {} 的发送队列长度设置为 {}", link.name, ACTIVE_TX_QUEUE_LEN);
        netlink.set_tx_qlen(&link.name, ACTIVE_TX_QUEUE_LEN)?;
        raised.push(link.name.clone());
    }
    Ok(())
}

fn build(ctx: &TreeContext<'_>, interfaces: Vec<String>) -> Result<BuiltTree> {
    ctx.tc
        .add_prio(&interfaces, "root", 1, ROOT_BANDS, &DEFAULT_PRIOMAP)?;

    let (mut parent, mut handle) = if ctx.scoped {
        ctx.tc.add_prio(&interfaces, DISRUPTED_FLOWID, 2, 2, &[0; 16])?;
        ctx.tc
            .add_fw_filter(&interfaces, "2:0", INJECTOR_CGROUP_CLASSID, MARKED_FLOWID)?;
        (MARKED_FLOWID.to_string(), 3)
    } else {
        (DISRUPTED_FLOWID.to_string(), 2)
    };

    for operation in LinkOperation::from_spec(ctx.spec) {
        operation.apply(ctx.tc, &interfaces, &parent, handle)?;
        parent = format!("{}:", handle);
        handle += 1;
    }

    let mut tree = BuiltTree {
        interfaces,
        ..Default::default()
    };

    let safeguards = safeguard_specs(ctx)?;
    ctx.registry
        .add_filters(&mut tree.safeguard_filters, safeguards, &tree.interfaces, SAFE_FLOWID)?;
    info!("已安装 {} 条安全过滤器", tree.safeguard_filters.len());

    tree.allowed_filters = install_hosts(
        ctx.registry,
        ctx.dns,
        ctx.allowed_hosts,
        &tree.interfaces,
        SAFE_FLOWID,
    )?;

    if !ctx.spec.has_targets() {
        info!("未配置主机或服务，扰动全部流量");
        let catch_all = FilterSpec::egress(NetworkEndpoint::new(*WILDCARD_NETWORK, 0, Protocol::All));
        ctx.registry.add_filters(
            &mut tree.catch_all_filters,
            [catch_all],
            &tree.interfaces,
            DISRUPTED_FLOWID,
        )?;
    } else {
        tree.host_filters = install_hosts(
            ctx.registry,
            ctx.dns,
            &ctx.spec.hosts,
            &tree.interfaces,
            DISRUPTED_FLOWID,
        )?;
    }

    Ok(tree)
}

/// 保证控制通道不被切断的过滤器
fn safeguard_specs(ctx: &TreeContext<'_>) -> Result<Vec<FilterSpec>> {
    let mut specs = Vec::new();

    match ctx.level {
        DisruptionLevel::Pod => {
            for route in ctx.netlink.default_routes()? {
                if let Some(gateway) = route.gateway {
                    debug!("默认网关 {} ({}) 加入安全通道", gateway, route.device);
                    specs.push(whole_host(host_network(gateway)));
                }
            }
            specs.extend(ctx.node_ip.map(|ip| whole_host(host_network(ip))));
        }
        DisruptionLevel::Node => {
            specs.push(FilterSpec {
                flow: Flow::Ingress,
                ..FilterSpec::egress(NetworkEndpoint::new(*WILDCARD_NETWORK, SSH_PORT, Protocol::Tcp))
            });
            specs.push(FilterSpec::egress(NetworkEndpoint::new(
                *WILDCARD_NETWORK,
                0,
                Protocol::Arp,
            )));
            specs.push(whole_host(host_network(METADATA_SERVICE_IP)));
        }
    }

    Ok(specs)
}

fn whole_host(ip: IpNet) -> FilterSpec {
    FilterSpec::egress(NetworkEndpoint::new(ip, 0, Protocol::All))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDns, FakeNetlink, FakeTc, TcCall};
    use crate::metrics::NoopMetrics;
    use crate::network::NetemParams;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        tc: Arc<FakeTc>,
        netlink: FakeNetlink,
        dns: FakeDns,
        registry: FilterRegistry,
    }

    fn fixture(netlink: FakeNetlink) -> Fixture {
        let tc = Arc::new(FakeTc::default());
        let registry = FilterRegistry::new(tc.clone(), Arc::new(NoopMetrics));
        Fixture {
            tc,
            netlink,
            dns: FakeDns::default(),
            registry,
        }
    }

    fn build_tree(
        f: &Fixture,
        spec: &DisruptionSpec,
        level: DisruptionLevel,
        scoped: bool,
    ) -> Result<BuiltTree> {
        apply_operations(&TreeContext {
            tc: f.tc.as_ref(),
            netlink: &f.netlink,
            dns: &f.dns,
            registry: &f.registry,
            spec,
            allowed_hosts: &[],
            level,
            scoped,
            node_ip: Some(Ipv4Addr::new(192, 168, 1, 20)),
        })
    }

    fn ifaces() -> Vec<String> {
        vec!["lo".to_string(), "eth0".to_string()]
    }

    #[test]
    fn test_netem_is_applied_once_per_interface() {
        let f = fixture(FakeNetlink::with_links(&[("lo", 1000), ("eth0", 1000)]));
        let spec = DisruptionSpec {
            drop: 90,
            delay: 1000,
            delay_jitter: 0,
            ..Default::default()
        };

        build_tree(&f, &spec, DisruptionLevel::Pod, false).unwrap();

        assert_eq!(
            f.tc.netem_calls(),
            vec![TcCall::AddNetem {
                ifaces: ifaces(),
                parent: "1:4".to_string(),
                handle: 2,
                params: NetemParams {
                    delay: Duration::from_secs(1),
                    jitter: Duration::from_millis(100),
                    drop: 90,
                    corrupt: 0,
                    duplicate: 0,
                },
            }]
        );
    }

    #[test]
    fn test_scoped_tree_chains_operations_under_marked_band() {
        let f = fixture(FakeNetlink::with_links(&[("eth0", 1000)]));
        let spec = DisruptionSpec {
            delay: 100,
            bandwidth_limit: 10_000,
            ..Default::default()
        };

        build_tree(&f, &spec, DisruptionLevel::Pod, true).unwrap();

        let eth0 = vec!["eth0".to_string()];
        let calls = f.tc.calls();
        assert_eq!(
            calls[..5],
            [
                TcCall::AddPrio {
                    ifaces: eth0.clone(),
                    parent: "root".to_string(),
                    handle: 1,
                    bands: 4,
                },
                TcCall::AddPrio {
                    ifaces: eth0.clone(),
                    parent: "1:4".to_string(),
                    handle: 2,
                    bands: 2,
                },
                TcCall::AddFwFilter {
                    ifaces: eth0.clone(),
                    parent: "2:0".to_string(),
                    mark: INJECTOR_CGROUP_CLASSID,
                    flowid: "2:2".to_string(),
                },
                TcCall::AddNetem {
                    ifaces: eth0.clone(),
                    parent: "2:2".to_string(),
                    handle: 3,
                    params: NetemParams {
                        delay: Duration::from_millis(100),
                        jitter: Duration::from_millis(10),
                        ..Default::default()
                    },
                },
                TcCall::AddOutputLimit {
                    ifaces: eth0,
                    parent: "3:".to_string(),
                    handle: 4,
                    bytes_per_sec: 10_000,
                },
            ]
        );
    }

    #[test]
    fn test_zero_length_tx_queues_are_raised_then_reset() {
        let f = fixture(FakeNetlink::with_links(&[("lo", 0), ("eth0", 1000)]));

        build_tree(&f, &DisruptionSpec::default(), DisruptionLevel::Pod, false).unwrap();

        assert_eq!(
            f.netlink.txqlen_calls(),
            vec![("lo".to_string(), 1000), ("lo".to_string(), 0)]
        );
    }

    #[test]
    fn test_failed_step_aborts_and_still_resets_tx_queue() {
        let f = fixture(FakeNetlink::with_links(&[("eth0", 0)]));
        f.tc.fail_next("add_netem");
        let spec = DisruptionSpec {
            drop: 10,
            ..Default::default()
        };

        assert!(build_tree(&f, &spec, DisruptionLevel::Pod, false).is_err());
        assert!(f.tc.added_filters().is_empty());
        assert_eq!(f.netlink.txqlen_calls().last(), Some(&("eth0".to_string(), 0)));
    }

    #[test]
    fn test_pod_level_without_node_ip_is_rejected() {
        let f = fixture(
            FakeNetlink::with_links(&[("eth0", 1000)]).with_gateway(Ipv4Addr::new(10, 0, 0, 1), "eth0"),
        );
        let spec = DisruptionSpec::default();

        let result = apply_operations(&TreeContext {
            tc: f.tc.as_ref(),
            netlink: &f.netlink,
            dns: &f.dns,
            registry: &f.registry,
            spec: &spec,
            allowed_hosts: &[],
            level: DisruptionLevel::Pod,
            scoped: false,
            node_ip: None,
        });

        assert!(matches!(result, Err(Error::Config(_))));
        assert!(f.tc.calls().is_empty());
        assert!(f.netlink.txqlen_calls().is_empty());
    }

    #[test]
    fn test_pod_safeguards_precede_target_filters() {
        let f = fixture(
            FakeNetlink::with_links(&[("eth0", 1000)]).with_gateway(Ipv4Addr::new(10, 0, 0, 1), "eth0"),
        );
        let spec = DisruptionSpec {
            hosts: vec![HostSpec::new("1.1.1.1").with_port(80).with_protocol(Protocol::Tcp)],
            ..Default::default()
        };

        let tree = build_tree(&f, &spec, DisruptionLevel::Pod, false).unwrap();

        let safeguards: Vec<String> = tree
            .safeguard_filters
            .iter()
            .map(|f| f.endpoint().ip.to_string())
            .collect();
        assert_eq!(safeguards, vec!["10.0.0.1/32", "192.168.1.20/32"]);
        assert!(tree.catch_all_filters.is_empty());

        let max_safe = tree.safeguard_filters.iter().map(|f| f.priority).max().unwrap();
        let min_target = tree.host_filters.values().flatten().map(|f| f.priority).min().unwrap();
        assert!(max_safe < min_target);

        for (_, priority, _, flowid) in f.tc.added_filters() {
            let expected = if priority <= max_safe { SAFE_FLOWID } else { DISRUPTED_FLOWID };
            assert_eq!(flowid, expected);
        }
    }

    #[test]
    fn test_node_safeguards_cover_ssh_arp_and_metadata() {
        let f = fixture(FakeNetlink::with_links(&[("eth0", 1000)]));

        let tree = build_tree(&f, &DisruptionSpec::default(), DisruptionLevel::Node, false).unwrap();

        let endpoints: Vec<String> = tree
            .safeguard_filters
            .iter()
            .map(|f| f.endpoint().to_string())
            .collect();
        assert_eq!(
            endpoints,
            vec![
                "ip=0.0.0.0/0; port=22; protocol=tcp",
                "ip=0.0.0.0/0; port=0; protocol=arp",
                "ip=169.254.169.254/32; port=0; protocol=all",
            ]
        );
        assert_eq!(tree.safeguard_filters[0].spec.flow, Flow::Ingress);
    }

    #[test]
    fn test_no_targets_installs_catch_all_per_protocol() {
        let f = fixture(FakeNetlink::with_links(&[("eth0", 1000)]));

        let tree = build_tree(&f, &DisruptionSpec::default(), DisruptionLevel::Node, false).unwrap();

        assert_eq!(tree.catch_all_filters.len(), 1);
        let catch_all_priority = tree.catch_all_filters[0].priority;
        let kernel: Vec<Protocol> = f
            .tc
            .added_filters()
            .into_iter()
            .filter(|(_, priority, _, _)| *priority == catch_all_priority)
            .map(|(_, _, filter, flowid)| {
                assert_eq!(flowid, DISRUPTED_FLOWID);
                assert_eq!(filter.dst_ip, Some(*WILDCARD_NETWORK));
                filter.protocol
            })
            .collect();
        assert_eq!(kernel, vec![Protocol::Tcp, Protocol::Udp]);
    }

    #[test]
    fn test_allowed_hosts_go_to_safe_band() {
        let f = fixture(FakeNetlink::with_links(&[("eth0", 1000)]));
        let allowed = vec![HostSpec::new("10.10.0.0/16")];
        let spec = DisruptionSpec::default();

        let tree = apply_operations(&TreeContext {
            tc: f.tc.as_ref(),
            netlink: &f.netlink,
            dns: &f.dns,
            registry: &f.registry,
            spec: &spec,
            allowed_hosts: &allowed,
            level: DisruptionLevel::Node,
            scoped: false,
            node_ip: None,
        })
        .unwrap();

        let filters = &tree.allowed_filters[&allowed[0]];
        assert_eq!(filters.len(), 1);
        let (_, _, _, flowid) = f
            .tc
            .added_filters()
            .into_iter()
            .find(|(_, priority, _, _)| *priority == filters[0].priority)
            .unwrap();
        assert_eq!(flowid, SAFE_FLOWID);
        assert!(filters[0].priority < tree.catch_all_filters[0].priority);
    }
}
