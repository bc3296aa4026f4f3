//! 连接状态管理
//!
//! 提供长连接的状态快照，包括：
//! - 当前状态（CLOSED / CONNECTING / OPEN / CLOSING）
//! - 重连统计
//! - 收发统计
//!
//! 只有 `ConnectionManager` 能修改状态，其他组件只能读取快照。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::utils::now_millis;
use crate::utils::time::format_millis;

/// 长连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// 未连接
    Closed,
    /// 连接中
    Connecting,
    /// 已连接
    Open,
    /// 关闭中
    Closing,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closing => write!(f, "CLOSING"),
        }
    }
}

/// 收发统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 最后活动时间（UTC毫秒时间戳）
    pub last_activity_time: Option<u64>,
}

/// 长连接状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub url: String,
    /// 本次连接建立时间（UTC毫秒时间戳）
    pub connected_at: Option<u64>,
    /// 建连尝试总次数
    pub connect_attempts: u64,
    /// 当前连续失败次数（成功建连后清零）
    pub consecutive_failures: u32,
    /// 最近一次断开原因
    pub last_close_reason: Option<String>,
    pub stats: ConnectionStats,
    pub sdk_version: String,
}

impl ConnectionSnapshot {
    fn new(url: String) -> Self {
        Self {
            state: ConnectionState::Closed,
            url,
            connected_at: None,
            connect_attempts: 0,
            consecutive_failures: 0,
            last_close_reason: None,
            stats: ConnectionStats::default(),
            sdk_version: crate::version::SDK_VERSION.to_string(),
        }
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        let connected = self
            .connected_at
            .map(format_millis)
            .unwrap_or_else(|| "未连接".to_string());
        format!(
            "【连接状态】状态: {} | 地址: {} | 建立于: {} | 尝试: {} 次 | 连续失败: {} | 发送{}帧/接收{}帧 | SDK版本: {}",
            self.state,
            self.url,
            connected,
            self.connect_attempts,
            self.consecutive_failures,
            self.stats.frames_sent,
            self.stats.frames_received,
            self.sdk_version,
        )
    }
}

/// 连接状态记录器（线程安全）
///
/// 读取方法是公开的，写入方法仅 crate 内部（`ConnectionManager`）可用。
#[derive(Debug, Clone)]
pub struct ConnectionStateTracker {
    inner: Arc<RwLock<ConnectionSnapshot>>,
}

impl ConnectionStateTracker {
    pub(crate) fn new(url: String) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConnectionSnapshot::new(url))),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.read().clone()
    }

    /// 切换状态，返回旧状态
    pub(crate) fn transition(&self, new_state: ConnectionState) -> ConnectionState {
        let mut snapshot = self.inner.write();
        let old = snapshot.state;
        snapshot.state = new_state;
        match new_state {
            ConnectionState::Connecting => snapshot.connect_attempts += 1,
            ConnectionState::Open => {
                snapshot.connected_at = Some(now_millis());
                snapshot.consecutive_failures = 0;
            }
            ConnectionState::Closed => snapshot.connected_at = None,
            ConnectionState::Closing => {}
        }
        old
    }

    pub(crate) fn record_failure(&self, reason: &str) -> u32 {
        let mut snapshot = self.inner.write();
        snapshot.consecutive_failures = snapshot.consecutive_failures.saturating_add(1);
        snapshot.last_close_reason = Some(reason.to_string());
        snapshot.consecutive_failures
    }

    pub(crate) fn record_close_reason(&self, reason: &str) {
        self.inner.write().last_close_reason = Some(reason.to_string());
    }

    pub(crate) fn increment_sent(&self, byte_count: usize) {
        let mut snapshot = self.inner.write();
        snapshot.stats.frames_sent += 1;
        snapshot.stats.bytes_sent += byte_count as u64;
        snapshot.stats.last_activity_time = Some(now_millis());
    }

    pub(crate) fn increment_received(&self, byte_count: usize) {
        let mut snapshot = self.inner.write();
        snapshot.stats.frames_received += 1;
        snapshot.stats.bytes_received += byte_count as u64;
        snapshot.stats.last_activity_time = Some(now_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tracker_transitions() {
        let tracker = ConnectionStateTracker::new("ws://127.0.0.1:9001".to_string());
        assert_eq!(tracker.state(), ConnectionState::Closed);

        assert_eq!(tracker.transition(ConnectionState::Connecting), ConnectionState::Closed);
        assert_eq!(tracker.record_failure("refused"), 1);
        tracker.transition(ConnectionState::Closed);
        tracker.transition(ConnectionState::Connecting);
        assert_eq!(tracker.record_failure("refused"), 2);
        tracker.transition(ConnectionState::Open);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Open);
        assert_eq!(snapshot.connect_attempts, 2);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.connected_at.is_some());
        assert_eq!(snapshot.last_close_reason.as_deref(), Some("refused"));
    }

    #[test]
    fn test_stats_and_summary() {
        let tracker = ConnectionStateTracker::new("ws://127.0.0.1:9001".to_string());
        tracker.transition(ConnectionState::Open);
        tracker.increment_sent(10);
        tracker.increment_received(20);
        tracker.increment_received(5);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.stats.frames_sent, 1);
        assert_eq!(snapshot.stats.frames_received, 2);
        assert_eq!(snapshot.stats.bytes_received, 25);
        assert!(snapshot.summary().contains("OPEN"));

        tracker.transition(ConnectionState::Closed);
        assert!(tracker.snapshot().connected_at.is_none());
    }
}
