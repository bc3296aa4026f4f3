use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use super::frame::{DirectRequest, DirectResponse};
use crate::error::{PrivchatSyncError, Result};

/// 直连请求/响应通道
///
/// 返回 `Ok` 表示收到了响应（任意状态码），`Err` 表示网络层失败（没有响应）。
#[async_trait]
pub trait DirectTransport: Send + Sync {
    async fn execute(&self, request: DirectRequest) -> Result<DirectResponse>;
}

/// 基于 reqwest 的直连实现
#[derive(Debug, Clone)]
pub struct ReqwestDirectTransport {
    client: Client,
}

impl ReqwestDirectTransport {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| PrivchatSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("HTTP 客户端已创建 (timeout: {:?})", request_timeout);
        Ok(Self { client })
    }
}

#[async_trait]
impl DirectTransport for ReqwestDirectTransport {
    async fn execute(&self, request: DirectRequest) -> Result<DirectResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| PrivchatSyncError::InvalidArgument(format!("无效的 HTTP 方法 {}: {}", request.method, e)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PrivchatSyncError::Timeout(format!("{} {}: {}", request.method, request.url, e))
            } else {
                PrivchatSyncError::Transport(format!("{} {}: {}", request.method, request.url, e))
            }
        })?;

        let status_code = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PrivchatSyncError::Transport(format!("读取响应失败: {}", e)))?;
        debug!("{} {} -> {} ({} bytes)", request.method, request.url, status_code, bytes.len());

        Ok(DirectResponse::new(status_code, decode_body(&bytes)))
    }
}

/// 响应体优先按 JSON 解析，否则作为字符串保留
fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
