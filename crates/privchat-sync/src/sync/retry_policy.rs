use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::config::RetryConfig;
use crate::error::{FailureDescriptor, FailureKind};

/// 一次失败之后的处理决定
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 等待 `delay` 后重试，`retry_count` 为递增后的重试次数
    Retry { retry_count: u32, delay: Duration },
    /// 可重试，但已经用完重试次数
    Exhausted,
    /// 不可重试的失败
    Terminal,
}

/// 重试决策器
#[derive(Debug, Clone)]
pub struct RetryManager {
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl RetryManager {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff.clone(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// 处理一次失败；`current_retry_count` 是本次尝试之前已经安排的重试次数
    pub fn handle_failure(&self, current_retry_count: u32, failure: &FailureDescriptor) -> RetryDecision {
        if !failure.is_retryable() {
            return RetryDecision::Terminal;
        }
        if current_retry_count >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            retry_count: current_retry_count + 1,
            delay: self.backoff.delay_for(current_retry_count),
        }
    }

    /// 重试用完后上报给调用方的失败，保留最后一次失败的状态码和响应体
    pub fn exhausted_failure(&self, last: &FailureDescriptor, attempts: u32) -> FailureDescriptor {
        FailureDescriptor {
            kind: FailureKind::RetryExhausted,
            message: format!("重试 {} 次后仍然失败: {}", self.max_retries, last.message),
            status_code: last.status_code,
            body: last.body.clone(),
            caused_by: None,
            attempts,
        }
    }
}
