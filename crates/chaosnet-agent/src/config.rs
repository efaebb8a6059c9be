//! 配置管理模块
//!
//! 该模块负责加载 Agent 的配置文件，支持 YAML/JSON 格式，
//! 并允许通过 `CHAOSNET_` 前缀的环境变量覆盖任意字段（嵌套字段用 `__` 分隔）。

use anyhow::{anyhow, Context, Result};
use chaosnet_common::HostSpec;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Agent 配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 日志级别（`RUST_LOG` 优先）
    pub log_level: String,
    /// 日志格式
    pub log_format: LogFormat,
    /// 只记录命令，不修改内核和 cgroup
    pub dry_run: bool,
    /// 宿主机 proc 挂载点
    pub mount_proc: String,
    /// 宿主机 cgroup 挂载点
    pub mount_cgroup: String,
    /// 网络故障配置
    pub network_disruption: NetworkDisruptionConfig,
    /// 指标服务器配置
    pub metrics: MetricsConfig,
}

/// 网络故障配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDisruptionConfig {
    /// 全局豁免主机，永远不受故障影响
    pub allowed_hosts: Vec<HostSpec>,
    /// 主机重新解析间隔（秒）
    pub host_resolve_interval_secs: u64,
}

impl NetworkDisruptionConfig {
    /// 主机重新解析间隔
    pub fn host_resolve_interval(&self) -> Duration {
        Duration::from_secs(self.host_resolve_interval_secs.max(1))
    }
}

impl Default for NetworkDisruptionConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            host_resolve_interval_secs: 60,
        }
    }
}

/// 指标服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 是否启用
    pub enabled: bool,
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl MetricsConfig {
    /// 监听的套接字地址
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .with_context(|| format!("无效的指标监听地址: {}", self.listen_address))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        create_default_config()
    }
}

/// 按扩展名确定配置文件格式
fn file_format(path: &Path) -> Result<FileFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
    }
}

/// 加载配置：默认值 < 配置文件 < 环境变量
pub fn load_config(config_path: Option<&Path>) -> Result<AgentConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;
        builder = builder.add_source(File::with_name(config_file).format(file_format(path)?));
    }

    let config = builder
        .add_source(
            Environment::with_prefix("CHAOSNET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("构建配置失败")?;

    let agent_config = config
        .try_deserialize::<AgentConfig>()
        .context("配置格式错误")?;

    debug!("已加载配置: {:?}", agent_config);
    Ok(agent_config)
}

/// 创建默认配置
pub fn create_default_config() -> AgentConfig {
    AgentConfig {
        log_level: "info".to_string(),
        log_format: LogFormat::Text,
        dry_run: false,
        mount_proc: "/proc/".to_string(),
        mount_cgroup: "/sys/fs/cgroup/".to_string(),
        network_disruption: NetworkDisruptionConfig::default(),
        metrics: MetricsConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosnet_common::Protocol;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_config(
            ".yaml",
            r#"
log_level: debug
log_format: json
dry_run: true
mount_proc: /host/proc/
network_disruption:
  allowed_hosts:
    - host: 10.0.0.0/8
      protocol: tcp
  host_resolve_interval_secs: 30
metrics:
  enabled: true
  port: 9191
"#,
        );

        let config = load_config(Some(file.path())).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.dry_run);
        assert_eq!(config.mount_proc, "/host/proc/");
        assert_eq!(config.mount_cgroup, "/sys/fs/cgroup/");
        assert_eq!(config.network_disruption.allowed_hosts.len(), 1);
        assert_eq!(config.network_disruption.allowed_hosts[0].protocol, Protocol::Tcp);
        assert_eq!(
            config.network_disruption.host_resolve_interval(),
            Duration::from_secs(30)
        );
        assert_eq!(config.metrics.socket_addr().unwrap().port(), 9191);
    }

    #[test]
    fn test_load_json_config_keeps_defaults() {
        let file = write_config(".json", r#"{ "metrics": { "enabled": true } }"#);

        let config = load_config(Some(file.path())).unwrap();

        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.network_disruption.host_resolve_interval_secs, 60);
    }

    #[test]
    fn test_unsupported_format_is_rejected() {
        let file = write_config(".toml", "log_level = \"info\"");
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_invalid_listen_address() {
        let metrics = MetricsConfig {
            listen_address: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert!(metrics.socket_addr().is_err());
    }
}
