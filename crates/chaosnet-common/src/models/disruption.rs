//! 网络故障规格模型
//!
//! 该模块定义一次注入所需的全部参数：故障强度（丢包、重复、损坏、延迟、带宽），
//! 以及故障的作用范围（主机列表、Kubernetes 服务列表和豁免主机列表）。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::protocol::{ConnState, Flow, Protocol};

/// 故障作用级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisruptionLevel {
    /// 作用于单个 Pod（容器级作用域）
    #[default]
    Pod,
    /// 作用于整个节点
    Node,
}

impl fmt::Display for DisruptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisruptionLevel::Pod => write!(f, "pod"),
            DisruptionLevel::Node => write!(f, "node"),
        }
    }
}

impl FromStr for DisruptionLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pod" => Ok(DisruptionLevel::Pod),
            "node" => Ok(DisruptionLevel::Node),
            _ => Err(Error::Validation(format!("无效的故障级别: {}", s))),
        }
    }
}

/// 主机目标
///
/// `host` 可以是 CIDR、单个 IPv4 地址或 DNS 名称，为空表示所有地址。
/// `port` 为 0 表示不限端口。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSpec {
    /// 主机（CIDR / IP / 域名）
    pub host: String,
    /// 端口
    pub port: u16,
    /// 协议
    pub protocol: Protocol,
    /// 流量方向
    pub flow: Flow,
    /// 连接状态过滤
    pub conn_state: ConnState,
}

impl HostSpec {
    /// 创建匹配任意端口、所有协议的出站主机目标
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// 指定端口
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 指定协议
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// 指定流量方向
    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flow = flow;
        self
    }

    /// 指定连接状态
    pub fn with_conn_state(mut self, conn_state: ConnState) -> Self {
        self.conn_state = conn_state;
        self
    }

    /// 拒绝 IPv6 字面量（地址或网段）
    fn check_address_family(&self) -> Result<()> {
        let is_v6 = match self.host.parse::<IpNet>() {
            Ok(net) => matches!(net, IpNet::V6(_)),
            Err(_) => matches!(self.host.parse::<IpAddr>(), Ok(IpAddr::V6(v6)) if v6.to_ipv4_mapped().is_none()),
        };

        if is_v6 {
            return Err(Error::UnsupportedAddressFamily(self.host.clone()));
        }

        Ok(())
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={}; port={}; protocol={}; flow={}",
            self.host, self.port, self.protocol, self.flow
        )
    }
}

/// 服务端口选择
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicePortSpec {
    /// 端口名称
    pub name: Option<String>,
    /// 端口号
    pub port: Option<u16>,
}

impl ServicePortSpec {
    /// 判断服务端口是否被选中：按名称或端口号匹配
    pub fn matches(&self, name: Option<&str>, port: u16) -> bool {
        let name_matches = match (&self.name, name) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => false,
        };

        name_matches || self.port == Some(port)
    }
}

/// Kubernetes 服务目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSpec {
    /// 命名空间
    pub namespace: String,
    /// 服务名称
    pub name: String,
    /// 选中的端口子集，为空表示服务的所有端口
    pub ports: Vec<ServicePortSpec>,
}

impl ServiceSpec {
    /// 创建服务目标
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ports: Vec::new(),
        }
    }

    /// 服务端口是否在选择范围内
    pub fn selects_port(&self, name: Option<&str>, port: u16) -> bool {
        self.ports.is_empty() || self.ports.iter().any(|p| p.matches(name, port))
    }
}

impl fmt::Display for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// 网络故障规格
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisruptionSpec {
    /// 丢包百分比
    pub drop: u32,
    /// 重复包百分比
    pub duplicate: u32,
    /// 损坏包百分比
    pub corrupt: u32,
    /// 延迟（毫秒）
    pub delay: u32,
    /// 延迟抖动（延迟的百分比，0 表示使用默认的 10%）
    pub delay_jitter: u32,
    /// 带宽限制（字节/秒，0 表示不限制）
    pub bandwidth_limit: u64,
    /// 目标主机
    pub hosts: Vec<HostSpec>,
    /// 目标服务
    pub services: Vec<ServiceSpec>,
    /// 豁免主机（永不受影响）
    pub allowed_hosts: Vec<HostSpec>,
}

impl DisruptionSpec {
    /// 是否配置了具体的主机或服务目标；否则故障作用于所有流量
    pub fn has_targets(&self) -> bool {
        !self.hosts.is_empty() || !self.services.is_empty()
    }

    /// 是否有主机要求按连接状态过滤
    pub fn needs_conntrack(&self) -> bool {
        self.hosts
            .iter()
            .any(|h| h.conn_state != ConnState::Undefined)
    }

    /// 校验故障规格
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("drop", self.drop),
            ("duplicate", self.duplicate),
            ("corrupt", self.corrupt),
        ] {
            if value > 100 {
                return Err(Error::Validation(format!(
                    "{} 必须在 0 到 100 之间，实际为 {}",
                    field, value
                )));
            }
        }

        if self.delay_jitter > 100 {
            return Err(Error::Validation(format!(
                "delayJitter 是延迟的百分比，不能超过 100，实际为 {}",
                self.delay_jitter
            )));
        }

        for host in self.hosts.iter().chain(self.allowed_hosts.iter()) {
            host.check_address_family()?;
        }

        for service in &self.services {
            if service.namespace.is_empty() || service.name.is_empty() {
                return Err(Error::Validation(format!(
                    "服务必须同时指定命名空间和名称: {}",
                    service
                )));
            }
        }

        debug!(
            "故障规格校验通过: {} 个主机, {} 个服务, {} 个豁免主机",
            self.hosts.len(),
            self.services.len(),
            self.allowed_hosts.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_deserialize_spec_from_yaml() {
        let yaml = r#"
drop: 90
delay: 1000
hosts:
  - host: 1.1.1.1
    port: 80
    protocol: TCP
  - host: example.com
    flow: ingress
    connState: est
services:
  - namespace: default
    name: backend
    ports:
      - name: http
      - port: 8443
allowedHosts:
  - host: 10.0.0.0/8
"#;

        let spec: DisruptionSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.drop, 90);
        assert_eq!(spec.delay, 1000);
        assert_eq!(spec.delay_jitter, 0);
        assert_eq!(spec.hosts[0], HostSpec::new("1.1.1.1").with_port(80).with_protocol(Protocol::Tcp));
        assert_eq!(spec.hosts[1].flow, Flow::Ingress);
        assert_eq!(spec.hosts[1].conn_state, ConnState::Established);
        assert_eq!(spec.hosts[1].protocol, Protocol::All);
        assert_eq!(spec.services[0].ports.len(), 2);
        assert_eq!(spec.allowed_hosts[0].host, "10.0.0.0/8");
        assert!(spec.has_targets());
        assert!(spec.needs_conntrack());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_empty_spec_disrupts_everything() {
        let spec = DisruptionSpec::default();
        assert!(!spec.has_targets());
        assert!(spec.validate().is_ok());
    }

    #[rstest]
    #[case(DisruptionSpec { drop: 101, ..Default::default() })]
    #[case(DisruptionSpec { corrupt: 150, ..Default::default() })]
    #[case(DisruptionSpec { delay: 100, delay_jitter: 101, ..Default::default() })]
    #[case(DisruptionSpec { services: vec![ServiceSpec::new("", "backend")], ..Default::default() })]
    fn test_validate_rejects_invalid_values(#[case] spec: DisruptionSpec) {
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[rstest]
    #[case("::1")]
    #[case("fd00::/64")]
    #[case("2001:db8::10")]
    fn test_validate_rejects_ipv6_hosts(#[case] host: &str) {
        let spec = DisruptionSpec {
            hosts: vec![HostSpec::new(host)],
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(Error::UnsupportedAddressFamily(_))
        ));
    }

    #[test]
    fn test_ipv4_mapped_address_is_accepted() {
        let spec = DisruptionSpec {
            allowed_hosts: vec![HostSpec::new("::ffff:10.0.0.1")],
            ..Default::default()
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_service_port_selection() {
        let mut service = ServiceSpec::new("default", "backend");
        assert!(service.selects_port(Some("grpc"), 9000));

        service.ports = vec![
            ServicePortSpec { name: Some("http".into()), port: None },
            ServicePortSpec { name: None, port: Some(8443) },
        ];
        assert!(service.selects_port(Some("http"), 80));
        assert!(service.selects_port(None, 8443));
        assert!(!service.selects_port(Some("grpc"), 9000));
    }

    #[test]
    fn test_disruption_level_parsing() {
        assert_eq!("Node".parse::<DisruptionLevel>().unwrap(), DisruptionLevel::Node);
        assert!("cluster".parse::<DisruptionLevel>().is_err());
    }
}
