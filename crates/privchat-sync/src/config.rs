//! 同步核心配置
//!
//! 所有可调参数集中在 [`PrivchatSyncConfig`]，均有默认值，可以通过 builder
//! 或 JSON 覆盖。除此之外不读取任何环境变量。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::{PrivchatSyncError, Result};

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 直连 API 基础地址，例如 https://chat.example.com/api
    pub api_base_url: String,
    /// 长连接地址，例如 wss://chat.example.com/ws
    pub channel_url: String,
    /// 每个直连请求都会带上的请求头（鉴权等）
    pub default_headers: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            channel_url: "ws://localhost:8080/ws".to_string(),
            default_headers: HashMap::new(),
        }
    }
}

/// 操作重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// 重连配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub backoff: BackoffPolicy,
    /// 单次建连超时（毫秒）
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            // 1s → 2s → 4s → 8s → 15s 封顶
            backoff: BackoffPolicy::new(1_000, 15_000).with_jitter(0.2),
            connect_timeout_ms: 10_000,
        }
    }
}

/// 心跳配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// 心跳间隔（毫秒）
    pub interval_ms: u64,
    /// 超过该时长没有收到任何帧即视为连接已断开（毫秒）
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
        }
    }
}

/// 请求超时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// 长连接请求等待响应的超时（毫秒）
    pub request_timeout_ms: u64,
    /// 直连请求的超时（毫秒）
    pub direct_timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 20_000,
            direct_timeout_ms: 30_000,
        }
    }
}

/// 连通性判断配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// 状态翻转后的稳定等待时间（毫秒），期间再次翻转则不发布
    pub settle_delay_ms: u64,
    /// 传输层网络错误导致的离线判断持续时间（毫秒）
    pub transport_failure_hold_ms: u64,
    /// 启动时的在线判断（没有平台信号时）
    pub initial_online: bool,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            transport_failure_hold_ms: 5_000,
            initial_online: true,
        }
    }
}

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 最近完成/失败的操作记录上限（用于后续入队的依赖校验）
    pub terminal_history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            terminal_history_limit: 1024,
        }
    }
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 事件广播缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

/// 同步核心配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivchatSyncConfig {
    pub server: ServerConfig,
    pub retry: RetryConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub request: RequestConfig,
    pub connectivity: ConnectivityConfig,
    pub queue: QueueConfig,
    pub events: EventConfig,
}

impl PrivchatSyncConfig {
    pub fn builder() -> PrivchatSyncConfigBuilder {
        PrivchatSyncConfigBuilder::new()
    }

    /// 从 JSON 加载（缺省字段使用默认值）
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PrivchatSyncConfig = serde_json::from_str(json)
            .map_err(|e| PrivchatSyncError::Config(format!("解析配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.api_base_url.trim().is_empty() {
            return Err(PrivchatSyncError::Config("server.api_base_url 不能为空".to_string()));
        }
        if self.server.channel_url.trim().is_empty() {
            return Err(PrivchatSyncError::Config("server.channel_url 不能为空".to_string()));
        }
        self.retry.backoff.validate("retry.backoff")?;
        self.reconnect.backoff.validate("reconnect.backoff")?;

        let timeouts = [
            ("reconnect.connect_timeout_ms", self.reconnect.connect_timeout_ms),
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
            ("heartbeat.timeout_ms", self.heartbeat.timeout_ms),
            ("request.request_timeout_ms", self.request.request_timeout_ms),
            ("request.direct_timeout_ms", self.request.direct_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(PrivchatSyncError::Config(format!("{} 必须大于 0", name)));
            }
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(PrivchatSyncError::Config(
                "heartbeat.timeout_ms 必须大于 heartbeat.interval_ms".to_string(),
            ));
        }
        if self.events.buffer_size == 0 {
            return Err(PrivchatSyncError::Config("events.buffer_size 必须大于 0".to_string()));
        }
        if self.queue.terminal_history_limit == 0 {
            return Err(PrivchatSyncError::Config("queue.terminal_history_limit 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request.request_timeout_ms)
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.request.direct_timeout_ms)
    }
}

pub struct PrivchatSyncConfigBuilder {
    config: PrivchatSyncConfig,
}

impl PrivchatSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PrivchatSyncConfig::default(),
        }
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.server.api_base_url = url.into();
        self
    }

    pub fn channel_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.server.channel_url = url.into();
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.config.server.default_headers.insert(key.into(), value.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.retry.backoff = backoff;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.reconnect.backoff = backoff;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.reconnect.connect_timeout_ms = ms;
        self
    }

    pub fn heartbeat(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.config.heartbeat = HeartbeatConfig { interval_ms, timeout_ms };
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request.request_timeout_ms = ms;
        self
    }

    pub fn direct_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request.direct_timeout_ms = ms;
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.connectivity.settle_delay_ms = ms;
        self
    }

    pub fn transport_failure_hold_ms(mut self, ms: u64) -> Self {
        self.config.connectivity.transport_failure_hold_ms = ms;
        self
    }

    pub fn initial_online(mut self, online: bool) -> Self {
        self.config.connectivity.initial_online = online;
        self
    }

    pub fn terminal_history_limit(mut self, limit: usize) -> Self {
        self.config.queue.terminal_history_limit = limit;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.events.buffer_size = size;
        self
    }

    pub fn build(self) -> PrivchatSyncConfig {
        self.config
    }
}

impl Default for PrivchatSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PrivchatSyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_builder_overrides() {
        let config = PrivchatSyncConfig::builder()
            .api_base_url("https://chat.example.com/api")
            .channel_url("wss://chat.example.com/ws")
            .header("Authorization", "Bearer t")
            .max_retries(8)
            .request_timeout_ms(5_000)
            .build();

        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_retries, 8);
        assert_eq!(config.server.default_headers.get("Authorization").map(String::as_str), Some("Bearer t"));
        assert_eq!(config.request.request_timeout_ms, 5_000);
    }

    #[test]
    fn test_from_json_partial() {
        let config = PrivchatSyncConfig::from_json_str(
            r#"{ "retry": { "max_retries": 2 }, "connectivity": { "settle_delay_ms": 100 } }"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.backoff, BackoffPolicy::default());
        assert_eq!(config.connectivity.settle_delay_ms, 100);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = PrivchatSyncConfig::builder().request_timeout_ms(0).build();
        assert!(matches!(config.validate(), Err(PrivchatSyncError::Config(_))));

        let config = PrivchatSyncConfig::builder().heartbeat(1_000, 500).build();
        assert!(config.validate().is_err());

        let config = PrivchatSyncConfig::builder().api_base_url("  ").build();
        assert!(config.validate().is_err());

        let config = PrivchatSyncConfig::builder().terminal_history_limit(0).build();
        assert!(matches!(config.validate(), Err(PrivchatSyncError::Config(_))));
        assert!(PrivchatSyncConfig::from_json_str(r#"{"queue": {"terminal_history_limit": 0}}"#).is_err());

        assert!(PrivchatSyncConfig::from_json_str("{ not json").is_err());
    }
}
