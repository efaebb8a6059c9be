//! 报文标记策略
//!
//! 只让目标容器的报文进入被扰动的频段：cgroup v2 下用一条按 cgroup 路径匹配的 iptables 规则打标记，
//! cgroup v1 下先把 classid 写入容器的 net_cls 控制器，再用 iptables 按 classid 打同一个标记。
//! 两种策略最终都由 tc 的 fw 过滤器消费这个标记。

use chaosnet_common::{DisruptionLevel, Error, Result};
use tracing::{debug, info, warn};

use crate::cgroup::Cgroup;
use crate::network::IpTables;

/// 注入使用的 net_cls classid，同时用作 fwmark（对应 tc 类 2:2）
pub const INJECTOR_CGROUP_CLASSID: u32 = 0x0002_0002;

/// net_cls 控制器
pub const NET_CLS_CONTROLLER: &str = "net_cls";

/// classid 文件
pub const NET_CLS_CLASSID_FILE: &str = "net_cls.classid";

/// 标记策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingStrategy {
    /// cgroup v2：按 cgroup 路径匹配
    CgroupPath,
    /// cgroup v1：net_cls classid
    ClassId,
}

/// 是否需要把故障限定在单个容器内
pub fn scoping_applies(level: DisruptionLevel, on_init: bool) -> bool {
    level == DisruptionLevel::Pod && !on_init
}

/// 按 cgroup 版本选择策略
pub fn strategy_for(cgroup: &dyn Cgroup) -> MarkingStrategy {
    if cgroup.is_cgroup_v2() {
        MarkingStrategy::CgroupPath
    } else {
        MarkingStrategy::ClassId
    }
}

/// 配置报文标记；不需要容器级作用域时返回 `None`
pub fn apply(
    cgroup: &dyn Cgroup,
    iptables: &dyn IpTables,
    level: DisruptionLevel,
    on_init: bool,
) -> Result<Option<MarkingStrategy>> {
    if !scoping_applies(level, on_init) {
        debug!("故障级别为 {} (on_init={})，跳过报文标记", level, on_init);
        return Ok(None);
    }

    let strategy = strategy_for(cgroup);
    match strategy {
        MarkingStrategy::CgroupPath => {
            let path = cgroup.relative_path("");
            info!("cgroup v2：标记来自 {} 的报文", path);
            iptables.mark_cgroup_path(&path, INJECTOR_CGROUP_CLASSID)?;
        }
        MarkingStrategy::ClassId => {
            let classid = format!("{:#010x}", INJECTOR_CGROUP_CLASSID);
            info!("cgroup v1：写入 net_cls classid {}", classid);
            cgroup.write(NET_CLS_CONTROLLER, NET_CLS_CLASSID_FILE, &classid)?;
            iptables.mark_class_id(INJECTOR_CGROUP_CLASSID, INJECTOR_CGROUP_CLASSID)?;
        }
    }

    Ok(Some(strategy))
}

/// 把 net_cls classid 重置为 0；容器已经退出导致文件不存在时视为成功
pub fn reset_classid(cgroup: &dyn Cgroup) -> Result<()> {
    if !cgroup.exists(NET_CLS_CONTROLLER) {
        debug!("net_cls cgroup 已不存在，跳过 classid 重置");
        return Ok(());
    }

    match cgroup.write(NET_CLS_CONTROLLER, NET_CLS_CLASSID_FILE, "0x0") {
        Ok(()) => Ok(()),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("net_cls classid 文件已消失: {}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::MockCgroup;
    use crate::network::iptables::MockIpTables;
    use mockall::predicate::eq;

    #[test]
    fn test_cgroup_v2_marks_by_path_only() {
        let mut cgroup = MockCgroup::new();
        cgroup.expect_is_cgroup_v2().return_const(true);
        cgroup
            .expect_relative_path()
            .return_const("/kubepods.slice/pod1/abc".to_string());
        cgroup.expect_write().never();

        let mut iptables = MockIpTables::new();
        iptables
            .expect_mark_cgroup_path()
            .withf(|path, mark| path.to_string() == "/kubepods.slice/pod1/abc" && *mark == INJECTOR_CGROUP_CLASSID)
            .times(1)
            .returning(|_, _| Ok(()));
        iptables.expect_mark_class_id().never();

        let strategy = apply(&cgroup, &iptables, DisruptionLevel::Pod, false).unwrap();
        assert_eq!(strategy, Some(MarkingStrategy::CgroupPath));
    }

    #[test]
    fn test_cgroup_v1_writes_classid_and_marks() {
        let mut cgroup = MockCgroup::new();
        cgroup.expect_is_cgroup_v2().return_const(false);
        cgroup
            .expect_write()
            .with(eq("net_cls"), eq("net_cls.classid"), eq("0x00020002"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut iptables = MockIpTables::new();
        iptables.expect_mark_cgroup_path().never();
        iptables
            .expect_mark_class_id()
            .with(eq(INJECTOR_CGROUP_CLASSID), eq(INJECTOR_CGROUP_CLASSID))
            .times(1)
            .returning(|_, _| Ok(()));

        let strategy = apply(&cgroup, &iptables, DisruptionLevel::Pod, false).unwrap();
        assert_eq!(strategy, Some(MarkingStrategy::ClassId));
    }

    #[test]
    fn test_node_level_and_on_init_skip_marking() {
        let mut cgroup = MockCgroup::new();
        cgroup.expect_is_cgroup_v2().never();
        let mut iptables = MockIpTables::new();
        iptables.expect_mark_cgroup_path().never();
        iptables.expect_mark_class_id().never();

        assert_eq!(apply(&cgroup, &iptables, DisruptionLevel::Node, false).unwrap(), None);
        assert_eq!(apply(&cgroup, &iptables, DisruptionLevel::Pod, true).unwrap(), None);
    }

    #[test]
    fn test_mark_failure_is_returned() {
        let mut cgroup = MockCgroup::new();
        cgroup.expect_is_cgroup_v2().return_const(true);
        cgroup.expect_relative_path().return_const("/".to_string());
        let mut iptables = MockIpTables::new();
        iptables
            .expect_mark_cgroup_path()
            .returning(|_, _| Err(Error::kernel("iptables", "mangle", "permission denied")));

        assert!(apply(&cgroup, &iptables, DisruptionLevel::Pod, false).is_err());
    }

    #[test]
    fn test_reset_classid_tolerates_missing_cgroup() {
        let mut cgroup = MockCgroup::new();
        cgroup.expect_exists().return_const(false);
        cgroup.expect_write().never();
        assert!(reset_classid(&cgroup).is_ok());

        let mut cgroup = MockCgroup::new();
        cgroup.expect_exists().return_const(true);
        cgroup.expect_write().returning(|_, _, _| {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")))
        });
        assert!(reset_classid(&cgroup).is_ok());
    }
}
