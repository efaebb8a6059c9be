//! 网络命名空间模块
//!
//! 网络命名空间是线程属性：进入与退出必须在同一个线程上成对完成，中间不能有挂起点。
//! 所有内核变更都通过 [`with_netns`] 包裹的同步闭包执行。

use std::fs::File;
use std::path::{Path, PathBuf};

use chaosnet_common::{Error, Result};
use nix::sched::{setns, CloneFlags};
use tracing::{error, trace};

/// 网络命名空间切换
pub trait Netns: Send + Sync {
    /// 当前线程进入目标命名空间
    fn enter(&self) -> Result<()>;

    /// 当前线程回到原命名空间
    fn exit(&self) -> Result<()>;
}

/// 在目标命名空间中执行闭包，无论闭包是否成功都会退出命名空间
pub fn with_netns<T>(netns: &dyn Netns, f: impl FnOnce() -> Result<T>) -> Result<T> {
    netns.enter()?;

    let result = f();

    if let Err(e) = netns.exit() {
        error!("退出网络命名空间失败: {}", e);
        if result.is_ok() {
            return Err(e);
        }
    }

    result
}

/// 通过 `/proc/<pid>/ns/net` 进入目标进程网络命名空间
pub struct ProcNetns {
    target: PathBuf,
    origin: File,
}

impl ProcNetns {
    /// 创建命名空间切换器；`mount_proc` 为宿主机 proc 的挂载点
    pub fn new(mount_proc: impl AsRef<Path>, pid: u32) -> Result<Self> {
        let target = mount_proc
            .as_ref()
            .join(pid.to_string())
            .join("ns")
            .join("net");
        let origin = File::open("/proc/thread-self/ns/net")?;

        Ok(Self { target, origin })
    }

    /// 目标命名空间文件
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Netns for ProcNetns {
    fn enter(&self) -> Result<()> {
        let target = File::open(&self.target).map_err(|e| {
            Error::State(format!("无法访问网络命名空间 {}: {}", self.target.display(), e))
        })?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(|e| {
            Error::State(format!("进入网络命名空间 {} 失败: {}", self.target.display(), e))
        })?;

        trace!("已进入网络命名空间 {}", self.target.display());
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        setns(&self.origin, CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::State(format!("回到原网络命名空间失败: {}", e)))?;

        trace!("已退出网络命名空间 {}", self.target.display());
        Ok(())
    }
}
