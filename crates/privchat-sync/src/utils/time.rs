//! 时间工具
//!
//! 所有对外暴露的时间字段统一使用 UTC 毫秒时间戳；
//! 内部计时（超时、退避）使用 `tokio::time::Instant`，不受系统时钟回拨影响。

use chrono::Utc;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// 把毫秒时间戳格式化为 RFC3339（用于日志）
pub fn format_millis(ms: u64) -> String {
    chrono::DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
