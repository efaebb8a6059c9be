//! iptables 标记模块
//!
//! 所有规则都写入 mangle 表中独立的 `CHAOSNET` 链，并由 OUTPUT 链跳转过去，
//! 清理时只需要删除跳转并清空、删除该链。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chaosnet_common::Result;
use tracing::{debug, info};

use super::executor::CommandExecutor;

/// iptables 可执行文件
const IPTABLES_BIN: &str = "iptables";

/// 注入规则所在的链
pub const CHAOSNET_CHAIN: &str = "CHAOSNET";

/// iptables 操作
#[cfg_attr(test, mockall::automock)]
pub trait IpTables: Send + Sync {
    /// 标记来自指定 cgroup（v2 路径）的报文
    fn mark_cgroup_path(&self, cgroup_path: &str, mark: u32) -> Result<()>;

    /// 标记带有指定 net_cls classid（cgroup v1）的报文
    fn mark_class_id(&self, class_id: u32, mark: u32) -> Result<()>;

    /// 记录新建和已建立连接，使命名空间内的 conntrack 开始跟踪连接
    fn log_conntrack(&self) -> Result<()>;

    /// 删除注入的所有规则
    fn clear(&self) -> Result<()>;
}

/// 基于 iptables 命令的实现
pub struct IpTablesCmd {
    executor: Arc<dyn CommandExecutor>,
    chain_ready: AtomicBool,
}

impl IpTablesCmd {
    /// 创建 iptables 操作器
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            chain_ready: AtomicBool::new(false),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.executor.run(IPTABLES_BIN, &args)
    }

    fn chain_exists(&self) -> bool {
        self.run(&["-t", "mangle", "-L", CHAOSNET_CHAIN, "-n"]).is_ok()
    }

    fn ensure_chain(&self) -> Result<()> {
        if self.chain_ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        if !self.chain_exists() {
            self.run(&["-t", "mangle", "-N", CHAOSNET_CHAIN])?;
            self.run(&["-t", "mangle", "-I", "OUTPUT", "-j", CHAOSNET_CHAIN])?;
            info!("已创建 iptables 链 {}", CHAOSNET_CHAIN);
        }

        self.chain_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn append(&self, rule: &[&str]) -> Result<()> {
        self.ensure_chain()?;

        let mut args = vec!["-t", "mangle", "-A", CHAOSNET_CHAIN];
        args.extend_from_slice(rule);
        self.run(&args).map(|_| ())
    }
}

impl IpTables for IpTablesCmd {
    fn mark_cgroup_path(&self, cgroup_path: &str, mark: u32) -> Result<()> {
        let mark = format!("{:#x}", mark);
        self.append(&["-m", "cgroup", "--path", cgroup_path, "-j", "MARK", "--set-mark", &mark])
    }

    fn mark_class_id(&self, class_id: u32, mark: u32) -> Result<()> {
        let class_id = format!("{:#x}", class_id);
        let mark = format!("{:#x}", mark);
        self.append(&["-m", "cgroup", "--cgroup", &class_id, "-j", "MARK", "--set-mark", &mark])
    }

    fn log_conntrack(&self) -> Result<()> {
        self.append(&[
            "-m",
            "conntrack",
            "--ctstate",
            "NEW,ESTABLISHED",
            "-j",
            "LOG",
            "--log-prefix",
            "chaosnet-conntrack: ",
        ])
    }

    fn clear(&self) -> Result<()> {
        if !self.chain_exists() {
            debug!("iptables 链 {} 不存在，无需清理", CHAOSNET_CHAIN);
            self.chain_ready.store(false, Ordering::SeqCst);
            return Ok(());
        }

        self.run(&["-t", "mangle", "-D", "OUTPUT", "-j", CHAOSNET_CHAIN])?;
        self.run(&["-t", "mangle", "-F", CHAOSNET_CHAIN])?;
        self.run(&["-t", "mangle", "-X", CHAOSNET_CHAIN])?;
        self.chain_ready.store(false, Ordering::SeqCst);

        info!("已删除 iptables 链 {}", CHAOSNET_CHAIN);
        Ok(())
    }
}
