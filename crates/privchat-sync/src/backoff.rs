//! 指数退避
//!
//! 重连和操作重试共用同一套退避计算：
//! `delay = min(max_delay, base_delay * multiplier^n * (1 + jitter))`，
//! 其中 `jitter ∈ [0, jitter_ratio)`。
//!
//! 只要 `jitter_ratio <= multiplier - 1`，带抖动的延迟对 `n` 单调不减，
//! 到达上限后保持为上限值。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PrivchatSyncError, Result};

/// 退避参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避倍数
    pub multiplier: f64,
    /// 随机抖动比例 [0, multiplier - 1]
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    /// 第 `attempt` 次退避的延迟（attempt 从 0 开始），带随机抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random::<f64>())
    }

    /// 使用给定的随机数 `sample ∈ [0, 1)` 计算延迟
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let cap = self.max_delay_ms as f64;
        // 指数部分提前封顶，避免 powi 溢出成 inf
        let exponent = attempt.min(64) as i32;
        let raw = (self.base_delay_ms as f64 * self.multiplier.powi(exponent)).min(cap * 2.0);
        let jitter = self.jitter_ratio * sample.clamp(0.0, 1.0);
        let delay = (raw * (1.0 + jitter)).min(cap).max(0.0);
        Duration::from_millis(delay as u64)
    }

    /// 不带抖动的延迟
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, 0.0)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(PrivchatSyncError::Config(format!("{}.base_delay_ms 必须大于 0", name)));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(PrivchatSyncError::Config(format!(
                "{}.base_delay_ms ({}) 不能大于 max_delay_ms ({})",
                name, self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PrivchatSyncError::Config(format!(
                "{}.multiplier 必须 >= 1.0，当前 {}",
                name, self.multiplier
            )));
        }
        if !self.jitter_ratio.is_finite()
            || self.jitter_ratio < 0.0
            || self.jitter_ratio > self.multiplier - 1.0
        {
            return Err(PrivchatSyncError::Config(format!(
                "{}.jitter_ratio 必须在 [0, multiplier - 1] 之间，当前 {}",
                name, self.jitter_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let policy = BackoffPolicy::new(100, 1_000).with_jitter(0.0);
        assert_eq!(policy.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.base_delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jittered_delay_is_non_decreasing() {
        let policy = BackoffPolicy::new(50, 10_000).with_jitter(0.5);
        for _ in 0..200 {
            let mut previous = Duration::ZERO;
            for attempt in 0..20 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= previous, "attempt {} delay {:?} < {:?}", attempt, delay, previous);
                assert!(delay <= Duration::from_millis(10_000));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy::new(1_000, 60_000).with_jitter(0.2);
        assert_eq!(policy.delay_with_jitter(0, 0.0), Duration::from_millis(1_000));
        assert!(policy.delay_with_jitter(0, 0.999) < Duration::from_millis(1_200));
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::default().validate("retry").is_ok());
        assert!(BackoffPolicy::new(0, 10).validate("retry").is_err());
        assert!(BackoffPolicy::new(100, 10).validate("retry").is_err());
        assert!(BackoffPolicy::new(10, 100).with_multiplier(0.5).validate("retry").is_err());
        assert!(BackoffPolicy::new(10, 100).with_jitter(1.5).validate("retry").is_err());
    }
}
