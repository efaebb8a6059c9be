//! 协议、流向与连接状态模型
//!
//! 这些类型决定一条 tc 过滤器匹配报文的方式：匹配哪种 L4 协议、
//! 按目的地址还是源地址匹配，以及是否只匹配特定 conntrack 状态的连接。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    /// TCP 协议
    Tcp,
    /// UDP 协议
    Udp,
    /// ARP 协议（只用于节点级保护过滤器）
    Arp,
    /// 所有协议
    #[default]
    All,
}

impl Protocol {
    /// 展开“所有协议”选择器，每个返回值对应一条内核过滤器
    pub fn variants(self) -> Vec<Protocol> {
        match self {
            Protocol::All => vec![Protocol::Tcp, Protocol::Udp],
            other => vec![other],
        }
    }

    /// IP 头中的协议号，ARP 与 All 没有对应值
    pub fn ip_proto(self) -> Option<u8> {
        match self {
            Protocol::Tcp => Some(6),
            Protocol::Udp => Some(17),
            Protocol::Arp | Protocol::All => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Arp => write!(f, "arp"),
            Protocol::All => write!(f, "all"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    /// 不区分大小写；无法识别的值（包括空字符串）一律视为所有协议
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "arp" => Protocol::Arp,
            _ => Protocol::All,
        })
    }
}

impl From<String> for Protocol {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl From<Protocol> for String {
    fn from(value: Protocol) -> Self {
        value.to_string()
    }
}

/// 流量方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    /// 出站：按目的地址/端口匹配
    #[default]
    Egress,
    /// 入站：按源地址/端口匹配（目标发出的响应报文）
    Ingress,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Egress => write!(f, "egress"),
            Flow::Ingress => write!(f, "ingress"),
        }
    }
}

/// 连接状态过滤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConnState {
    /// 不过滤连接状态
    #[default]
    Undefined,
    /// 只匹配新建连接
    New,
    /// 只匹配已建立连接
    Established,
}

impl ConnState {
    /// tc flower 的 ct_state 参数
    pub fn ct_state(self) -> Option<&'static str> {
        match self {
            ConnState::Undefined => None,
            ConnState::New => Some("+trk+new"),
            ConnState::Established => Some("+trk+est"),
        }
    }
}

impl From<String> for ConnState {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "new" => ConnState::New,
            "est" | "established" => ConnState::Established,
            _ => ConnState::Undefined,
        }
    }
}

impl From<ConnState> for String {
    fn from(value: ConnState) -> Self {
        match value {
            ConnState::Undefined => String::new(),
            ConnState::New => "new".to_string(),
            ConnState::Established => "est".to_string(),
        }
    }
}
