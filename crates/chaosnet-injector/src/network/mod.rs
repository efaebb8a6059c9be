//! 内核网络驱动模块
//!
//! 该模块定义注入引擎与内核交互的三个接缝（流量控制、网卡/路由、iptables）
//! 以及 DNS 客户端。每个接缝都是 trait，生产实现通过 [`executor::CommandExecutor`]
//! 执行系统命令，测试和 dry-run 使用记录型实现。

pub mod dns;
pub mod executor;
pub mod iptables;
pub mod netlink;
pub mod tc;

pub use dns::{DnsClient, SystemDnsClient};
pub use executor::{CommandExecutor, DryRunExecutor, SystemExecutor};
pub use iptables::{IpTables, IpTablesCmd};
pub use netlink::{IpRoute2, Link, NetlinkAdapter, Route};
pub use tc::{FilterMatch, NetemParams, Tc, TrafficController, DEFAULT_PRIOMAP};
