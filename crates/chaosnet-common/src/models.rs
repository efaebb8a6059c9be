//! 数据模型模块
//!
//! 该模块定义了 ChaosNet 中使用的核心数据模型，包括故障规格、
//! 主机/服务目标以及协议、流向等分类字段，并提供序列化/反序列化功能。

pub mod disruption;
pub mod protocol;
