//! 主机解析模块
//!
//! 把主机描述解析为一组 IPv4 网段。解析顺序：空字符串表示所有地址，
//! 其次是 CIDR，然后是单个 IP（得到 /32），最后按域名做 DNS 查询。

use std::net::{IpAddr, Ipv4Addr};

use chaosnet_common::{Error, Result};
use ipnet::{IpNet, Ipv4Net};
use once_cell::sync::Lazy;

use crate::network::DnsClient;

/// 匹配所有 IPv4 地址的网段
pub static WILDCARD_NETWORK: Lazy<IpNet> = Lazy::new(|| IpNet::V4(Ipv4Net::default()));

/// 单个 IPv4 地址对应的 /32 网段
pub fn host_network(ip: Ipv4Addr) -> IpNet {
    IpNet::V4(Ipv4Net::from(ip))
}

/// 解析主机描述
pub fn resolve_host(dns: &dyn DnsClient, host: &str) -> Result<Vec<IpNet>> {
    let host = host.trim();

    if host.is_empty() {
        return Ok(vec![*WILDCARD_NETWORK]);
    }

    if let Ok(network) = host.parse::<IpNet>() {
        return match network {
            IpNet::V4(v4) => Ok(vec![IpNet::V4(v4.trunc())]),
            IpNet::V6(_) => Err(Error::UnsupportedAddressFamily(host.to_string())),
        };
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(vec![host_network(v4)]),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Ok(vec![host_network(v4)]),
                None => Err(Error::UnsupportedAddressFamily(host.to_string())),
            },
        };
    }

    let ips = dns.resolve(host)?;
    if ips.is_empty() {
        return Err(Error::Resolution(format!("{} 没有解析到任何地址", host)));
    }

    Ok(ips.into_iter().map(host_network).collect())
}
