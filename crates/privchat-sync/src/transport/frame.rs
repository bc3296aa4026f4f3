//! 传输层报文格式
//!
//! 直连：`{method, url, headers, body}` → `{status_code, body}`。
//! 长连接：发出的帧带 `correlation_id`；收到的帧有 `correlation_id` 的是响应，
//! 否则是服务端主动推送的 `{type, payload}`。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PrivchatSyncError, Result};

/// 直连请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl DirectRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// 直连响应（任意状态码；网络层失败不会产生响应）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectResponse {
    pub status_code: u16,
    #[serde(default)]
    pub body: Value,
}

impl DirectResponse {
    pub fn new(status_code: u16, body: Value) -> Self {
        Self { status_code, body }
    }
}

/// 长连接发出的请求帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub correlation_id: String,
    /// 发起请求的操作 ID
    pub request_id: String,
    pub operation: String,
    pub payload: Value,
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn default_status() -> u16 {
    200
}

/// 长连接收到的响应帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub correlation_id: String,
    #[serde(default = "default_status")]
    pub status_code: u16,
    #[serde(default)]
    pub body: Value,
}

/// 服务端主动推送的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// 长连接收到的帧
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Push(PushFrame),
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(PrivchatSyncError::Serialization(format!("帧不是 JSON 对象: {}", raw)));
        }
        let has_correlation = value
            .get("correlation_id")
            .map(|id| !id.is_null())
            .unwrap_or(false);
        if has_correlation {
            Ok(InboundFrame::Response(serde_json::from_value(value)?))
        } else {
            Ok(InboundFrame::Push(serde_json::from_value(value)?))
        }
    }
}

/// 心跳帧
pub fn heartbeat_frame(timestamp: u64) -> String {
    serde_json::json!({ "type": "ping", "timestamp": timestamp }).to_string()
}
