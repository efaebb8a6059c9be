//! 命令执行模块
//!
//! `tc`、`ip` 和 `iptables` 都通过 [`CommandExecutor`] 执行。生产环境直接调用系统命令，
//! dry-run 模式下只记录会修改内核状态的命令，只读命令照常执行。

use std::process::Command;

use chaosnet_common::{Error, Result};
use tracing::{debug, info};

/// 命令执行器
pub trait CommandExecutor: Send + Sync {
    /// 执行命令并返回标准输出
    fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// 拼接完整命令行，用于日志和错误信息
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// 调用系统命令的执行器
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let line = command_line(program, args);
        debug!("执行命令: {}", line);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::kernel(program, line.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::kernel(
                program,
                line,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// dry-run 执行器：只读命令交给内部执行器，其余命令只记录日志
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor {
    inner: SystemExecutor,
}

impl DryRunExecutor {
    /// 创建 dry-run 执行器
    pub fn new() -> Self {
        Self::default()
    }

    fn is_read_only(args: &[String]) -> bool {
        args.iter()
            .any(|arg| matches!(arg.as_str(), "show" | "-L" | "-S" | "--list"))
    }
}

impl CommandExecutor for DryRunExecutor {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        if Self::is_read_only(args) {
            return self.inner.run(program, args);
        }

        info!("[dry-run] 跳过命令: {}", command_line(program, args));
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &str) -> Vec<String> {
        raw.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_command_line_joins_arguments() {
        assert_eq!(
            command_line("tc", &args("qdisc del dev eth0 root")),
            "tc qdisc del dev eth0 root"
        );
    }

    #[test]
    fn test_dry_run_skips_mutating_commands() {
        let executor = DryRunExecutor::new();
        let out = executor
            .run("chaosnet-command-that-does-not-exist", &args("qdisc add dev eth0 root"))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_dry_run_runs_read_only_commands() {
        assert!(DryRunExecutor::is_read_only(&args("qdisc show dev eth0")));
        assert!(DryRunExecutor::is_read_only(&args("-t mangle -L CHAOSNET -n")));
        assert!(!DryRunExecutor::is_read_only(&args("filter delete dev eth0 priority 49150")));
    }

    #[test]
    fn test_system_executor_reports_missing_binary() {
        let err = SystemExecutor
            .run("chaosnet-command-that-does-not-exist", &args("show"))
            .unwrap_err();
        assert!(matches!(err, Error::KernelOperation { .. }));
        assert!(err.to_string().contains("chaosnet-command-that-does-not-exist show"));
    }
}
