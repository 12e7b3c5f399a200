//! 重连与轮询退避策略

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 推送重连策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// 延迟 = base × 第 N 次，超过次数后停止重连
    Linear { base_delay_ms: u64, max_attempts: u32 },
    /// 指数退避 + full jitter，不限次数
    ExponentialJitter { base_delay_ms: u64, max_delay_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Linear {
            base_delay_ms: 1000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次失败（从 1 开始）之后的等待时间，`None` 表示放弃
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Linear {
                base_delay_ms,
                max_attempts,
            } => {
                if attempt > max_attempts {
                    return None;
                }
                Some(Duration::from_millis(base_delay_ms.saturating_mul(attempt as u64)))
            }
            ReconnectPolicy::ExponentialJitter {
                base_delay_ms,
                max_delay_ms,
            } => {
                let cap = exponential(base_delay_ms, attempt, max_delay_ms);
                Some(Duration::from_millis(jitter(cap)))
            }
        }
    }
}

/// 轮询失败后的退避
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollBackoff {
    pub max_interval_secs: u64,
}

impl PollBackoff {
    /// 连续失败 `failures` 次后的下一次等待
    pub fn next_interval(&self, base: Duration, failures: u32) -> Duration {
        if failures == 0 {
            return base;
        }
        let base_ms = base.as_millis() as u64;
        let cap = exponential(base_ms, failures + 1, self.max_interval_secs.saturating_mul(1000));
        // 不低于基础间隔
        Duration::from_millis(base_ms + jitter(cap.saturating_sub(base_ms)))
    }
}

fn exponential(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

fn jitter(cap_ms: u64) -> u64 {
    if cap_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delay_grows_with_attempt() {
        let policy = ReconnectPolicy::Linear {
            base_delay_ms: 1000,
            max_attempts: 3,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for(4), None);
    }

    #[test]
    fn test_exponential_jitter_never_gives_up_and_respects_cap() {
        let policy = ReconnectPolicy::ExponentialJitter {
            base_delay_ms: 100,
            max_delay_ms: 2000,
        };
        for attempt in 1..50 {
            let delay = policy.delay_for(attempt).unwrap();
            assert!(delay <= Duration::from_millis(2000));
        }
        assert!(policy.delay_for(1).unwrap() <= Duration::from_millis(100));
    }

    #[test]
    fn test_poll_backoff_stays_between_base_and_cap() {
        let backoff = PollBackoff {
            max_interval_secs: 60,
        };
        let base = Duration::from_secs(5);
        assert_eq!(backoff.next_interval(base, 0), base);
        for failures in 1..20 {
            let wait = backoff.next_interval(base, failures);
            assert!(wait >= base);
            assert!(wait <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_policy_deserializes_from_config() {
        let policy: ReconnectPolicy = serde_json::from_str(
            r#"{"kind": "exponential_jitter", "base_delay_ms": 500, "max_delay_ms": 30000}"#,
        )
        .unwrap();
        assert_eq!(
            policy,
            ReconnectPolicy::ExponentialJitter {
                base_delay_ms: 500,
                max_delay_ms: 30000
            }
        );
    }
}
