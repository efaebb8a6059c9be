//! 链路操作模块
//!
//! 每种故障原语对应一个 [`LinkOperation`]。树构建器按顺序应用它们：
//! 每个操作在当前 (parent, handle) 处挂上自己的 qdisc，下一个操作以该 handle 作为 parent。

use std::time::Duration;

use chaosnet_common::{DisruptionSpec, Result};
use tracing::info;

use crate::network::{NetemParams, TrafficController};

/// 未指定抖动百分比时使用的默认值
pub const DEFAULT_JITTER_PERCENT: u32 = 10;

/// 抖动下限
pub const MIN_JITTER: Duration = Duration::from_millis(1);

/// 链路操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOperation {
    /// netem：延迟、抖动、丢包、损坏、重复
    Netem(NetemParams),
    /// tbf：带宽限制
    Bandwidth {
        /// 字节/秒
        bytes_per_sec: u64,
    },
}

impl LinkOperation {
    /// 根据故障规格生成操作列表；值为 0 的原语不会生成 qdisc
    pub fn from_spec(spec: &DisruptionSpec) -> Vec<LinkOperation> {
        let mut operations = Vec::new();

        if spec.delay > 0 || spec.drop > 0 || spec.corrupt > 0 || spec.duplicate > 0 {
            let delay = Duration::from_millis(u64::from(spec.delay));
            operations.push(LinkOperation::Netem(NetemParams {
                delay,
                jitter: jitter(delay, spec.delay_jitter),
                drop: spec.drop,
                corrupt: spec.corrupt,
                duplicate: spec.duplicate,
            }));
        }

        if spec.bandwidth_limit > 0 {
            operations.push(LinkOperation::Bandwidth {
                bytes_per_sec: spec.bandwidth_limit,
            });
        }

        operations
    }

    /// 在 `parent` 下以 `handle` 挂载本操作的 qdisc
    pub fn apply(
        &self,
        tc: &dyn TrafficController,
        interfaces: &[String],
        parent: &str,
        handle: u32,
    ) -> Result<()> {
        match self {
            LinkOperation::Netem(params) => {
                info!(
                    "添加 netem (parent={}, handle={}:): delay={:?} jitter={:?} drop={}% corrupt={}% duplicate={}%",
                    parent, handle, params.delay, params.jitter, params.drop, params.corrupt, params.duplicate
                );
                tc.add_netem(interfaces, parent, handle, params)
            }
            LinkOperation::Bandwidth { bytes_per_sec } => {
                info!(
                    "添加带宽限制 (parent={}, handle={}:): {} 字节/秒",
                    parent, handle, bytes_per_sec
                );
                tc.add_output_limit(interfaces, parent, handle, *bytes_per_sec)
            }
        }
    }
}

/// 计算延迟抖动：未指定时取延迟的 10%，否则取延迟的 `percent`%，延迟非零时不小于 1ms
pub fn jitter(delay: Duration, percent: u32) -> Duration {
    if delay.is_zero() {
        return Duration::ZERO;
    }

    let percent = if percent == 0 {
        DEFAULT_JITTER_PERCENT
    } else {
        percent
    };

    (delay * percent / 100).max(MIN_JITTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeTc, TcCall};
    use rstest::rstest;

    #[rstest]
    #[case(1000, 0, 100_000)]
    #[case(1000, 50, 500_000)]
    #[case(15, 0, 1_500)]
    #[case(5, 0, 1_000)]
    #[case(0, 30, 0)]
    fn test_jitter(#[case] delay_ms: u64, #[case] percent: u32, #[case] expected_us: u64) {
        assert_eq!(
            jitter(Duration::from_millis(delay_ms), percent),
            Duration::from_micros(expected_us)
        );
    }

    #[test]
    fn test_zero_values_suppress_operations() {
        assert!(LinkOperation::from_spec(&DisruptionSpec::default()).is_empty());

        let spec = DisruptionSpec {
            bandwidth_limit: 1024,
            ..Default::default()
        };
        assert_eq!(
            LinkOperation::from_spec(&spec),
            vec![LinkOperation::Bandwidth { bytes_per_sec: 1024 }]
        );
    }

    #[test]
    fn test_netem_precedes_bandwidth() {
        let spec = DisruptionSpec {
            drop: 5,
            bandwidth_limit: 4096,
            ..Default::default()
        };
        let operations = LinkOperation::from_spec(&spec);

        assert_eq!(operations.len(), 2);
        assert!(matches!(operations[0], LinkOperation::Netem(p) if p.drop == 5 && p.delay.is_zero()));
        assert!(matches!(operations[1], LinkOperation::Bandwidth { .. }));
    }

    #[test]
    fn test_apply_dispatches_to_traffic_controller() {
        let tc = FakeTc::default();
        let ifaces = vec!["eth0".to_string()];

        LinkOperation::Bandwidth { bytes_per_sec: 2048 }
            .apply(&tc, &ifaces, "2:", 3)
            .unwrap();

        assert_eq!(
            tc.calls(),
            vec![TcCall::AddOutputLimit {
                ifaces,
                parent: "2:".to_string(),
                handle: 3,
                bytes_per_sec: 2048,
            }]
        );
    }
}
