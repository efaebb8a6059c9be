//! DNS 解析模块

use std::net::{IpAddr, Ipv4Addr};

use chaosnet_common::{Error, Result};
use tracing::debug;

/// DNS 客户端
#[cfg_attr(test, mockall::automock)]
pub trait DnsClient: Send + Sync {
    /// 解析域名的 IPv4 地址，没有任何 A 记录时返回解析错误
    fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// 使用系统解析器（getaddrinfo）的 DNS 客户端
#[derive(Debug, Clone, Default)]
pub struct SystemDnsClient;

impl DnsClient for SystemDnsClient {
    fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let answers = dns_lookup::lookup_host(host)
            .map_err(|e| Error::Resolution(format!("解析 {} 失败: {}", host, e)))?;

        let mut ips: Vec<Ipv4Addr> = answers
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        ips.sort();
        ips.dedup();

        if ips.is_empty() {
            return Err(Error::Resolution(format!("{} 没有 IPv4 记录", host)));
        }

        debug!("{} 解析结果: {:?}", host, ips);
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_localhost() {
        let ips = SystemDnsClient.resolve("localhost").unwrap();
        assert!(ips.contains(&Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_unknown_name_is_resolution_error() {
        let err = SystemDnsClient
            .resolve("chaosnet-does-not-exist.invalid")
            .unwrap_err();
        assert!(err.is_resolution());
    }
}
