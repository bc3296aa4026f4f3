//! 事件系统模块 - 同步核心的可观测事件
//!
//! 功能包括：
//! - 操作生命周期事件（入队、发送、重试、完成、失败）
//! - 在线状态变更事件
//! - 连接状态变更事件
//!
//! 这些事件只用于观测（UI 状态、日志、统计），操作结果的契约仍然是
//! `on_complete` / `on_error` 回调。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::connection_state::ConnectionState;
use crate::error::FailureDescriptor;
use crate::sync::operation::{OperationId, OperationKind, TransportHint};
use crate::utils::now_millis;

/// 同步核心事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 操作已入队
    OperationEnqueued {
        id: OperationId,
        kind: OperationKind,
        target: String,
        timestamp: u64,
    },
    /// 操作开始一次尝试
    OperationSending {
        id: OperationId,
        attempt: u32,
        transport: TransportHint,
        timestamp: u64,
    },
    /// 操作可重试失败，已安排重试
    OperationRetrying {
        id: OperationId,
        attempt: u32,
        delay_ms: u64,
        failure: FailureDescriptor,
        timestamp: u64,
    },
    /// 操作成功
    OperationCompleted {
        id: OperationId,
        attempts: u32,
        timestamp: u64,
    },
    /// 操作最终失败
    OperationFailed {
        id: OperationId,
        failure: FailureDescriptor,
        timestamp: u64,
    },
    /// 在线状态变更
    OnlineStateChanged { online: bool, timestamp: u64 },
    /// 长连接状态变更
    ConnectionStateChanged {
        old_state: ConnectionState,
        new_state: ConnectionState,
        timestamp: u64,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::OperationEnqueued { .. } => "operation_enqueued",
            SyncEvent::OperationSending { .. } => "operation_sending",
            SyncEvent::OperationRetrying { .. } => "operation_retrying",
            SyncEvent::OperationCompleted { .. } => "operation_completed",
            SyncEvent::OperationFailed { .. } => "operation_failed",
            SyncEvent::OnlineStateChanged { .. } => "online_state_changed",
            SyncEvent::ConnectionStateChanged { .. } => "connection_state_changed",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::OperationEnqueued { timestamp, .. }
            | SyncEvent::OperationSending { timestamp, .. }
            | SyncEvent::OperationRetrying { timestamp, .. }
            | SyncEvent::OperationCompleted { timestamp, .. }
            | SyncEvent::OperationFailed { timestamp, .. }
            | SyncEvent::OnlineStateChanged { timestamp, .. }
            | SyncEvent::ConnectionStateChanged { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的操作 ID（如果有）
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            SyncEvent::OperationEnqueued { id, .. }
            | SyncEvent::OperationSending { id, .. }
            | SyncEvent::OperationRetrying { id, .. }
            | SyncEvent::OperationCompleted { id, .. }
            | SyncEvent::OperationFailed { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn online_changed(online: bool) -> Self {
        SyncEvent::OnlineStateChanged {
            online,
            timestamp: now_millis(),
        }
    }

    pub fn connection_changed(old_state: ConnectionState, new_state: ConnectionState) -> Self {
        SyncEvent::ConnectionStateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 操作ID过滤器
    pub operation_ids: Option<Vec<OperationId>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation_ids(mut self, operation_ids: Vec<OperationId>) -> Self {
        self.operation_ids = Some(operation_ids);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ids) = &self.operation_ids {
            match event.operation_id() {
                Some(id) if ids.contains(id) => {}
                _ => return false,
            }
        }

        true
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub last_event_time: Option<u64>,
}

/// 事件管理器
#[derive(Debug, Clone)]
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    stats: Arc<Mutex<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(Mutex::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.lock();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景，仅打 debug
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e.0.event_type());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    pub fn stats(&self) -> EventStats {
        self.stats.lock().clone()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
