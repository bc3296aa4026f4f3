//! 长连接请求/响应关联
//!
//! 每个请求分配一个 correlation id 并登记为 [`PendingRequest`]，直到收到响应、
//! 超时或连接断开。没有匹配请求的响应帧原样交还给调用方（转给推送分发器）。

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection_manager::FrameSender;
use crate::error::{PrivchatSyncError, Result};
use crate::transport::{InboundFrame, OutboundFrame, ResponseFrame};

struct PendingRequest {
    request_id: String,
    sent_at: Instant,
    timeout_handle: AbortHandle,
    respond_to: oneshot::Sender<Result<ResponseFrame>>,
}

impl PendingRequest {
    fn settle(self, result: Result<ResponseFrame>) {
        self.timeout_handle.abort();
        let _ = self.respond_to.send(result);
    }
}

struct CorrelatorInner {
    sender: Arc<dyn FrameSender>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    timeout: Duration,
}

impl CorrelatorInner {
    fn expire(&self, correlation_id: &str) {
        let pending = self.pending.lock().remove(correlation_id);
        if let Some(pending) = pending {
            warn!(
                "长连接请求超时: request_id={}, correlation_id={}, 已等待 {:?}",
                pending.request_id,
                correlation_id,
                pending.sent_at.elapsed()
            );
            let _ = pending
                .respond_to
                .send(Err(PrivchatSyncError::Timeout(format!("{:?} 内没有收到响应", self.timeout))));
        }
    }
}

/// 等待中的响应
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: String,
    receiver: oneshot::Receiver<Result<ResponseFrame>>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn wait(self) -> Result<ResponseFrame> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(PrivchatSyncError::ConnectionLost("请求已被丢弃".to_string())),
        }
    }
}

/// 请求关联器
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
}

impl RequestCorrelator {
    pub fn new(sender: Arc<dyn FrameSender>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                sender,
                pending: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// 连接当前是否可用
    pub fn is_available(&self) -> bool {
        self.inner.sender.state().is_open()
    }

    /// 发送请求；连接不是 OPEN 时同步返回错误
    pub fn send(&self, request_id: &str, operation: &str, payload: Value) -> Result<PendingResponse> {
        if !self.is_available() {
            return Err(PrivchatSyncError::NotConnected);
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let text = OutboundFrame {
            correlation_id: correlation_id.clone(),
            request_id: request_id.to_string(),
            operation: operation.to_string(),
            payload,
        }
        .to_json()?;

        let (respond_to, receiver) = oneshot::channel();
        let weak: Weak<CorrelatorInner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        let expiring_id = correlation_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&expiring_id);
            }
        });

        // 先登记再发送，响应不可能早于登记到达
        self.inner.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                request_id: request_id.to_string(),
                sent_at: Instant::now(),
                timeout_handle: timer.abort_handle(),
                respond_to,
            },
        );

        if let Err(e) = self.inner.sender.send_frame(text) {
            self.discard(&correlation_id);
            return Err(e);
        }
        // 发送期间连接断开：fail_all 可能已经跑过，这里自己撤回
        if !self.is_available() {
            self.discard(&correlation_id);
            return Err(PrivchatSyncError::ConnectionLost("发送时连接已断开".to_string()));
        }

        debug!("长连接请求已发送: request_id={}, correlation_id={}", request_id, correlation_id);
        Ok(PendingResponse {
            correlation_id,
            receiver,
        })
    }

    /// 处理收到的帧；匹配到请求时返回 None，否则把帧交还调用方
    pub fn handle_inbound(&self, frame: InboundFrame) -> Option<InboundFrame> {
        let response = match frame {
            InboundFrame::Response(response) => response,
            push => return Some(push),
        };

        let pending = self.inner.pending.lock().remove(&response.correlation_id);
        match pending {
            Some(pending) => {
                debug!(
                    "收到响应: request_id={}, status={}, 耗时 {:?}",
                    pending.request_id,
                    response.status_code,
                    pending.sent_at.elapsed()
                );
                pending.settle(Ok(response));
                None
            }
            None => {
                debug!("响应没有匹配的请求: correlation_id={}", response.correlation_id);
                Some(InboundFrame::Response(response))
            }
        }
    }

    /// 连接断开时让所有等待中的请求失败，返回失败的数量
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            pending.settle(Err(PrivchatSyncError::ConnectionLost(reason.to_string())));
        }
        if count > 0 {
            warn!("连接断开，{} 个长连接请求失败: {}", count, reason);
        }
        count
    }

    fn discard(&self, correlation_id: &str) {
        if let Some(pending) = self.inner.pending.lock().remove(correlation_id) {
            pending.timeout_handle.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}
