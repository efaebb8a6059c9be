//! cgroup 访问模块
//!
//! 通过 `<proc>/<pid>/cgroup` 找到目标进程所属的 cgroup，并读写其控制器文件。
//! 同时支持 cgroup v1（每个控制器独立层级）和 cgroup v2（统一层级）。

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chaosnet_common::{Error, Result};
use tracing::{debug, info};

/// cgroup 访问器
#[cfg_attr(test, mockall::automock)]
pub trait Cgroup: Send + Sync {
    /// 宿主机是否使用 cgroup v2 统一层级
    fn is_cgroup_v2(&self) -> bool;

    /// 读取控制器文件
    fn read(&self, controller: &str, file: &str) -> Result<String>;

    /// 写入控制器文件
    fn write(&self, controller: &str, file: &str, data: &str) -> Result<()>;

    /// 目标进程在控制器层级中的相对路径（v2 下忽略控制器名）
    fn relative_path(&self, controller: &str) -> String;

    /// 目标进程的控制器目录是否仍然存在
    fn exists(&self, controller: &str) -> bool;
}

/// 基于 cgroupfs 的访问器
#[derive(Debug, Clone)]
pub struct ProcCgroup {
    mount: PathBuf,
    paths: HashMap<String, String>,
    v2: bool,
    dry_run: bool,
}

impl ProcCgroup {
    /// 读取 `<mount_proc>/<pid>/cgroup` 创建访问器
    pub fn new(
        mount_proc: impl AsRef<Path>,
        mount_cgroup: impl AsRef<Path>,
        pid: u32,
        dry_run: bool,
    ) -> Result<Self> {
        let cgroup_file = mount_proc.as_ref().join(pid.to_string()).join("cgroup");
        let content = fs::read_to_string(&cgroup_file).map_err(|e| {
            Error::State(format!("读取 {} 失败: {}", cgroup_file.display(), e))
        })?;

        let mount = mount_cgroup.as_ref().to_path_buf();
        let v2 = mount.join("cgroup.controllers").exists();
        let paths = parse_proc_cgroup(&content);

        debug!("目标进程 {} 的 cgroup: v2={} paths={:?}", pid, v2, paths);
        Ok(Self {
            mount,
            paths,
            v2,
            dry_run,
        })
    }

    fn controller_dir(&self, controller: &str) -> PathBuf {
        let relative = self.relative_path(controller);
        let relative = relative.trim_start_matches('/');

        if self.v2 {
            self.mount.join(relative)
        } else {
            self.mount.join(controller).join(relative)
        }
    }
}

/// 解析 `hierarchy-ID:controller-list:path` 格式；v2 的统一层级以空字符串为键
fn parse_proc_cgroup(content: &str) -> HashMap<String, String> {
    let mut paths = HashMap::new();

    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(_), Some(controllers), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        if controllers.is_empty() {
            paths.insert(String::new(), path.to_string());
            continue;
        }

        for controller in controllers.split(',') {
            let controller = controller.trim_start_matches("name=");
            paths.insert(controller.to_string(), path.to_string());
        }
    }

    paths
}

impl Cgroup for ProcCgroup {
    fn is_cgroup_v2(&self) -> bool {
        self.v2
    }

    fn read(&self, controller: &str, file: &str) -> Result<String> {
        let path = self.controller_dir(controller).join(file);
        Ok(fs::read_to_string(path)?)
    }

    fn write(&self, controller: &str, file: &str, data: &str) -> Result<()> {
        let path = self.controller_dir(controller).join(file);

        if self.dry_run {
            info!("[dry-run] 跳过写入 {}: {}", path.display(), data);
            return Ok(());
        }

        fs::write(&path, data).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::Io(e),
            _ => Error::kernel("cgroup write", path.display().to_string(), e),
        })
    }

    fn relative_path(&self, controller: &str) -> String {
        let key = if self.v2 { "" } else { controller };
        self.paths.get(key).cloned().unwrap_or_else(|| "/".to_string())
    }

    fn exists(&self, controller: &str) -> bool {
        self.controller_dir(controller).is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const V1_CGROUP: &str = "12:net_cls,net_prio:/kubepods/burstable/pod1234/abcdef\n\
                             4:memory:/kubepods/burstable/pod1234/abcdef\n\
                             1:name=systemd:/kubepods/burstable/pod1234/abcdef\n";

    fn setup(proc_content: &str, v2: bool) -> (TempDir, TempDir) {
        let proc_dir = tempfile::tempdir().unwrap();
        let cgroup_dir = tempfile::tempdir().unwrap();

        fs::create_dir_all(proc_dir.path().join("42")).unwrap();
        fs::write(proc_dir.path().join("42/cgroup"), proc_content).unwrap();
        if v2 {
            fs::write(cgroup_dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        }

        (proc_dir, cgroup_dir)
    }

    #[test]
    fn test_parse_v1_and_v2_lines() {
        let paths = parse_proc_cgroup(V1_CGROUP);
        assert_eq!(paths["net_cls"], "/kubepods/burstable/pod1234/abcdef");
        assert_eq!(paths["net_prio"], "/kubepods/burstable/pod1234/abcdef");
        assert!(paths.contains_key("systemd"));

        let paths = parse_proc_cgroup("0::/kubepods.slice/cri-containerd-abc.scope\n");
        assert_eq!(paths[""], "/kubepods.slice/cri-containerd-abc.scope");
    }

    #[test]
    fn test_v1_write_net_cls_classid() {
        let (proc_dir, cgroup_dir) = setup(V1_CGROUP, false);
        let dir = cgroup_dir
            .path()
            .join("net_cls/kubepods/burstable/pod1234/abcdef");
        fs::create_dir_all(&dir).unwrap();

        let cgroup = ProcCgroup::new(proc_dir.path(), cgroup_dir.path(), 42, false).unwrap();
        assert!(!cgroup.is_cgroup_v2());
        assert!(cgroup.exists("net_cls"));

        cgroup.write("net_cls", "net_cls.classid", "0x00020002").unwrap();
        assert_eq!(cgroup.read("net_cls", "net_cls.classid").unwrap(), "0x00020002");
    }

    #[test]
    fn test_v2_relative_path_ignores_controller() {
        let (proc_dir, cgroup_dir) = setup("0::/kubepods.slice/pod1/abc\n", true);
        let cgroup = ProcCgroup::new(proc_dir.path(), cgroup_dir.path(), 42, false).unwrap();

        assert!(cgroup.is_cgroup_v2());
        assert_eq!(cgroup.relative_path("net_cls"), "/kubepods.slice/pod1/abc");
        assert!(!cgroup.exists(""));
    }

    #[test]
    fn test_write_to_missing_cgroup_is_io_not_found() {
        let (proc_dir, cgroup_dir) = setup(V1_CGROUP, false);
        let cgroup = ProcCgroup::new(proc_dir.path(), cgroup_dir.path(), 42, false).unwrap();

        match cgroup.write("net_cls", "net_cls.classid", "0x0") {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_dry_run_does_not_write() {
        let (proc_dir, cgroup_dir) = setup(V1_CGROUP, false);
        let cgroup = ProcCgroup::new(proc_dir.path(), cgroup_dir.path(), 42, true).unwrap();

        cgroup.write("net_cls", "net_cls.classid", "0x00020002").unwrap();
        assert!(!cgroup_dir.path().join("net_cls").exists());
    }
}
