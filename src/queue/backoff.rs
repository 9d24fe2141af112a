use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 指数退避
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 2_000,
            multiplier: 2.0,
            max_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            multiplier: 2.0,
            max_ms: max.as_millis() as u64,
        }
    }

    /// 第 `attempt` 次失败后的等待时间，`attempt` 从 1 开始
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn zero_attempt_uses_initial_delay() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
    }
}
