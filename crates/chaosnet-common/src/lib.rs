//! ChaosNet Common - 网络故障注入的共享数据模型与错误类型
//!
//! 该模块提供 ChaosNet 项目中所有组件共享的数据结构和错误处理机制，
//! 包括故障规格（DisruptionSpec）、协议/流向模型以及统一的错误类型。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::disruption::*;
pub use models::protocol::*;
