//! 推送分发
//!
//! 把服务端主动推送的帧归类为实体变更或控制消息，按收到的顺序同步调用监听器。
//! 无法识别的帧记录日志后丢弃。

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::transport::{InboundFrame, PushFrame};
use crate::utils::now_millis;

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    BatchDeleted,
    /// 连接级控制消息（pong、ping、control.*）
    Control,
}

/// 归一化后的变更内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangePayload {
    Entity {
        entity: String,
        id: String,
        data: Option<Value>,
    },
    Batch {
        entity: String,
        ids: Vec<String>,
    },
    Control {
        command: String,
        data: Value,
    },
}

/// 变更通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub payload: ChangePayload,
    /// 收到的时间（UTC毫秒时间戳）
    pub received_at: u64,
}

impl ChangeEvent {
    /// 实体名（控制消息返回 None）
    pub fn entity(&self) -> Option<&str> {
        match &self.payload {
            ChangePayload::Entity { entity, .. } | ChangePayload::Batch { entity, .. } => Some(entity),
            ChangePayload::Control { .. } => None,
        }
    }
}

/// 变更监听器
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) {
        self(event)
    }
}

/// 监听器 ID，用于取消注册
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 分发统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub dropped: u64,
    /// 没有匹配请求的响应帧
    pub unmatched_responses: u64,
}

/// 推送分发器
#[derive(Default)]
pub struct PushDispatcher {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    next_listener_id: AtomicU64,
    stats: Mutex<DispatchStats>,
}

impl PushDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// 解析原始文本后分发
    pub fn handle_raw(&self, raw: &str) {
        match InboundFrame::parse(raw) {
            Ok(frame) => self.handle(frame),
            Err(e) => {
                warn!("无法解析的推送帧，已丢弃: {} ({})", raw, e);
                self.stats.lock().dropped += 1;
            }
        }
    }

    /// 分发一帧
    pub fn handle(&self, frame: InboundFrame) {
        let push = match frame {
            InboundFrame::Push(push) => push,
            InboundFrame::Response(response) => {
                debug!(
                    "丢弃没有匹配请求的响应: correlation_id={}, status={}",
                    response.correlation_id, response.status_code
                );
                self.stats.lock().unmatched_responses += 1;
                return;
            }
        };

        let event = match classify(&push) {
            Some(event) => event,
            None => {
                warn!("未知的推送类型，已丢弃: {}", push.frame_type);
                self.stats.lock().dropped += 1;
                return;
            }
        };

        // 监听器列表先复制出来，回调里可以注册/注销监听器
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in &listeners {
            listener.on_change(&event);
        }
        self.stats.lock().dispatched += 1;
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().clone()
    }
}

/// 把推送帧归类为变更；无法识别时返回 None
pub fn classify(frame: &PushFrame) -> Option<ChangeEvent> {
    let received_at = now_millis();
    let frame_type = frame.frame_type.as_str();

    if frame_type == "ping" || frame_type == "pong" {
        return Some(control(frame_type, frame.payload.clone(), received_at));
    }
    if let Some(command) = frame_type.strip_prefix("control.") {
        if command.is_empty() {
            return None;
        }
        return Some(control(command, frame.payload.clone(), received_at));
    }

    let (entity, action) = frame_type.rsplit_once('.')?;
    if entity.is_empty() {
        return None;
    }
    let entity = entity.to_string();
    let data = frame.payload.get("data").cloned();

    let (kind, payload) = match action {
        "created" | "updated" | "deleted" => {
            let id = id_string(frame.payload.get("id")?)?;
            let kind = match action {
                "created" => ChangeKind::Created,
                "updated" => ChangeKind::Updated,
                _ => ChangeKind::Deleted,
            };
            (kind, ChangePayload::Entity { entity, id, data })
        }
        "batch_deleted" => {
            let ids = frame
                .payload
                .get("ids")?
                .as_array()?
                .iter()
                .map(id_string)
                .collect::<Option<Vec<_>>>()?;
            (ChangeKind::BatchDeleted, ChangePayload::Batch { entity, ids })
        }
        _ => return None,
    };

    Some(ChangeEvent {
        kind,
        payload,
        received_at,
    })
}

fn control(command: &str, data: Value, received_at: u64) -> ChangeEvent {
    ChangeEvent {
        kind: ChangeKind::Control,
        payload: ChangePayload::Control {
            command: command.to_string(),
            data,
        },
        received_at,
    }
}

/// 服务端 ID 可能是字符串或数字
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
