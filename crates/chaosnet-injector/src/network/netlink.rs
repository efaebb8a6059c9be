//! 网卡与路由查询模块
//!
//! 通过 iproute2 的 JSON 输出（`ip -j`）读取网络命名空间中的网卡和默认路由。

use std::net::Ipv4Addr;
use std::sync::Arc;

use chaosnet_common::{Error, Result};
use serde::Deserialize;

use super::executor::CommandExecutor;

/// ip 可执行文件
const IP_BIN: &str = "ip";

/// 网卡
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// 网卡名称
    pub name: String,
    /// 网卡索引
    pub index: u32,
    /// 发送队列长度
    pub tx_queue_len: u32,
}

/// 路由
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// 网关
    pub gateway: Option<Ipv4Addr>,
    /// 出口网卡
    pub device: String,
}

/// 网卡与路由适配器
pub trait NetlinkAdapter: Send + Sync {
    /// 列出所有网卡
    fn link_list(&self) -> Result<Vec<Link>>;

    /// 按名称查找网卡
    fn link_by_name(&self, name: &str) -> Result<Link>;

    /// IPv4 默认路由
    fn default_routes(&self) -> Result<Vec<Route>>;

    /// 设置网卡发送队列长度
    fn set_tx_qlen(&self, name: &str, qlen: u32) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    txqlen: u32,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: String,
}

/// 基于 iproute2 的适配器
pub struct IpRoute2 {
    executor: Arc<dyn CommandExecutor>,
}

impl IpRoute2 {
    /// 创建适配器
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn run_json<T: for<'de> Deserialize<'de>>(&self, args: &[&str]) -> Result<Vec<T>> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let out = self.executor.run(IP_BIN, &args)?;

        // dry-run 或空命名空间下输出可能为空
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&out)?)
    }
}

impl NetlinkAdapter for IpRoute2 {
    fn link_list(&self) -> Result<Vec<Link>> {
        let links: Vec<IpLink> = self.run_json(&["-j", "link", "show"])?;

        Ok(links
            .into_iter()
            .map(|l| Link {
                name: l.ifname,
                index: l.ifindex,
                tx_queue_len: l.txqlen,
            })
            .collect())
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        let links: Vec<IpLink> = self.run_json(&["-j", "link", "show", "dev", name])?;

        links
            .into_iter()
            .next()
            .map(|l| Link {
                name: l.ifname,
                index: l.ifindex,
                tx_queue_len: l.txqlen,
            })
            .ok_or_else(|| Error::kernel("ip link show", name, "网卡不存在"))
    }

    fn default_routes(&self) -> Result<Vec<Route>> {
        let routes: Vec<IpRoute> = self.run_json(&["-j", "-4", "route", "show", "default"])?;

        Ok(routes
            .into_iter()
            .map(|r| Route {
                gateway: r.gateway.and_then(|gw| gw.parse().ok()),
                device: r.dev,
            })
            .collect())
    }

    fn set_tx_qlen(&self, name: &str, qlen: u32) -> Result<()> {
        let args: Vec<String> = ["link", "set", "dev", name, "txqueuelen"]
            .iter()
            .map(|a| a.to_string())
            .chain(std::iter::once(qlen.to_string()))
            .collect();

        self.executor.run(IP_BIN, &args).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedExecutor(&'static str);

    impl CommandExecutor for CannedExecutor {
        fn run(&self, _program: &str, _args: &[String]) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_parse_link_list() {
        let adapter = IpRoute2::new(Arc::new(CannedExecutor(
            r#"[{"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP"],"mtu":65536,"txqlen":1000},
                {"ifindex":3,"ifname":"eth0","mtu":1500,"txqlen":0,"link_index":4}]"#,
        )));

        let links = adapter.link_list().unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].name, "eth0");
        assert_eq!(links[1].tx_queue_len, 0);
    }

    #[test]
    fn test_parse_default_routes() {
        let adapter = IpRoute2::new(Arc::new(CannedExecutor(
            r#"[{"dst":"default","gateway":"10.244.0.1","dev":"eth0","flags":[]}]"#,
        )));

        let routes = adapter.default_routes().unwrap();
        assert_eq!(routes[0].gateway, Some(Ipv4Addr::new(10, 244, 0, 1)));
        assert_eq!(routes[0].device, "eth0");
    }

    #[test]
    fn test_missing_link_is_an_error() {
        let adapter = IpRoute2::new(Arc::new(CannedExecutor("")));
        assert!(adapter.link_by_name("eth9").is_err());
    }
}
