//! 错误处理模块
//!
//! 该模块提供 ChaosNet 项目的统一错误处理机制。错误按照注入引擎的处理策略分类：
//! 解析错误在下一个刷新周期重试，内核操作错误对当前注入/清理调用是致命的，
//! 监听错误只会触发监听器自修复，状态错误直接返回给调用方。

use std::fmt;
use std::io;
use thiserror::Error;

/// ChaosNet 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 主机解析错误（DNS 查询失败、无记录或 CIDR 格式错误）
    #[error("主机解析错误: {0}")]
    Resolution(String),

    /// 不支持的地址族（目前只支持 IPv4）
    #[error("不支持的地址族: {0}")]
    UnsupportedAddressFamily(String),

    /// tc / netlink / iptables / cgroup 内核操作失败
    #[error("内核操作 {operation} 失败 ({target}): {message}")]
    KernelOperation {
        /// 操作名称，例如 `tc qdisc add`
        operation: String,
        /// 操作对象：网卡、parent、handle 或优先级
        target: String,
        /// 底层错误信息
        message: String,
    },

    /// Kubernetes 监听通道错误或被关闭
    #[error("监听错误: {0}")]
    Watch(String),

    /// Kubernetes API 调用失败
    #[error("Kubernetes API 错误: {0}")]
    Kubernetes(String),

    /// 注入器状态错误（重复注入、命名空间不可访问等）
    #[error("状态错误: {0}")]
    State(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 故障规格校验失败
    #[error("规格校验失败: {0}")]
    Validation(String),

    /// 多个错误的聚合（清理阶段会尽量继续执行所有步骤）
    #[error("共发生 {} 个错误: {}", .0.len(), AggregateDisplay(.0))]
    Aggregate(Vec<Error>),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// ChaosNet 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 创建内核操作错误
    pub fn kernel(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Error::KernelOperation {
            operation: operation.into(),
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// 是否为可在下个周期重试的解析类错误
    pub fn is_resolution(&self) -> bool {
        matches!(self, Error::Resolution(_) | Error::UnsupportedAddressFamily(_))
    }

    /// 是否为状态错误
    pub fn is_state(&self) -> bool {
        matches!(self, Error::State(_))
    }

    /// 将一组错误合并为单个结果：没有错误时返回 `Ok(())`，只有一个时原样返回
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }
}

struct AggregateDisplay<'a>(&'a [Error]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(Error::aggregate(vec![]).is_ok());
    }

    #[test]
    fn test_aggregate_single_error_is_unwrapped() {
        let err = Error::aggregate(vec![Error::State("已注入".into())]).unwrap_err();
        assert!(err.is_state());
    }

    #[test]
    fn test_aggregate_lists_every_error() {
        let err = Error::aggregate(vec![
            Error::kernel("tc qdisc del", "eth0", "no such device"),
            Error::Config("缺少字段".into()),
        ])
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("2 个错误"));
        assert!(message.contains("eth0"));
        assert!(message.contains("缺少字段"));
    }
}
