use serde_json::{json, Value};
use std::collections::HashMap;

use crate::error::Result;
use crate::sync::operation::{OperationKind, SyncOperation};
use crate::transport::DirectRequest;

/// 长连接请求的操作名和载荷
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub operation: String,
    pub payload: Value,
}

/// 把同步操作映射成具体的传输请求
pub trait RequestMapper: Send + Sync {
    fn direct_request(&self, operation: &SyncOperation, payload: Value) -> Result<DirectRequest>;

    fn channel_request(&self, operation: &SyncOperation, payload: Value) -> Result<ChannelRequest>;
}

/// 默认的 REST 风格映射
///
/// CREATE → POST、UPDATE → PATCH、DELETE → DELETE，地址为 `{api_base_url}/{target}`，
/// 请求头带 `Idempotency-Key: <操作 ID>`，重试时不变。
#[derive(Debug, Clone)]
pub struct RestRequestMapper {
    base_url: String,
    default_headers: HashMap<String, String>,
}

impl RestRequestMapper {
    pub fn new(base_url: impl Into<String>, default_headers: HashMap<String, String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_headers,
        }
    }

    fn method(kind: OperationKind) -> &'static str {
        match kind {
            OperationKind::Create => "POST",
            OperationKind::Update => "PATCH",
            OperationKind::Delete => "DELETE",
        }
    }
}

impl RequestMapper for RestRequestMapper {
    fn direct_request(&self, operation: &SyncOperation, payload: Value) -> Result<DirectRequest> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Idempotency-Key".to_string(), operation.id.to_string()),
        ];
        let mut extra: Vec<_> = self.default_headers.iter().collect();
        extra.sort();
        headers.extend(extra.into_iter().map(|(key, value)| (key.clone(), value.clone())));

        let body = if payload.is_null() { None } else { Some(payload) };
        Ok(DirectRequest {
            method: Self::method(operation.kind).to_string(),
            url: format!("{}/{}", self.base_url, operation.target.trim_start_matches('/')),
            headers,
            body,
        })
    }

    fn channel_request(&self, operation: &SyncOperation, payload: Value) -> Result<ChannelRequest> {
        Ok(ChannelRequest {
            operation: operation.kind.channel_verb().to_string(),
            payload: json!({ "target": operation.target, "body": payload }),
        })
    }
}
