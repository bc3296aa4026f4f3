//! Privchat Sync - 即时通讯客户端的离线优先同步核心
//!
//! 本 crate 负责把本地写操作可靠地同步到服务端，并把服务端推送的变更交给上层：
//! - 📡 连通性监控：聚合平台网络信号和传输层信号，防抖后给出在线判断
//! - 🔗 长连接管理：唯一的一条长连接，在线时指数退避重连，心跳保活
//! - 🧭 请求关联：长连接上的请求/响应按 correlation id 配对，超时和断线都会失败
//! - 📬 推送分发：服务端推送归一化为实体变更，按顺序交给监听器
//! - 🧵 同步队列：串行发送、依赖门控、可重试失败自动重试、最终失败级联
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use privchat_sync::{OperationRequest, PrivchatSync, PrivchatSyncConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PrivchatSyncConfig::builder()
//!         .api_base_url("https://chat.example.com/api")
//!         .channel_url("wss://chat.example.com/ws")
//!         .header("Authorization", "Bearer <token>")
//!         .build();
//!
//!     let sync = PrivchatSync::new(config)?;
//!     sync.start().await?;
//!
//!     // 先创建会话，再在会话里发消息；消息的载荷读取会话的服务端 ID
//!     let conversation = sync
//!         .enqueue(
//!             OperationRequest::create("conversations", json!({"title": "周末"}))
//!                 .on_error(|id, failure| eprintln!("{} 失败: {}", id, failure)),
//!         )
//!         .await?;
//!     sync.enqueue(
//!         OperationRequest::create(
//!             "messages",
//!             privchat_sync::Payload::deferred(move |deps| {
//!                 let server_id = deps.first().and_then(|r| r.get("id")).cloned();
//!                 Ok(json!({"conversation_id": server_id, "text": "hi"}))
//!             }),
//!         )
//!         .depends_on(conversation)
//!         .persistent(),
//!     )
//!     .await?;
//!
//!     sync.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod backoff;
pub mod config;
pub mod connection_manager;
pub mod connection_state;
pub mod error;
pub mod events;
pub mod network;
pub mod push_dispatcher;
pub mod request_correlator;
pub mod sdk;
pub mod sync;
pub mod transport;
pub mod utils;
pub mod version;

#[cfg(test)]
mod test_support;

// 重新导出核心类型，方便使用
pub use backoff::BackoffPolicy;
pub use config::{
    ConnectivityConfig, EventConfig, HeartbeatConfig, PrivchatSyncConfig, PrivchatSyncConfigBuilder, QueueConfig,
    ReconnectConfig, RequestConfig, RetryConfig, ServerConfig,
};
pub use connection_manager::{ConnectionEvent, ConnectionManager, FrameSender};
pub use connection_state::{ConnectionSnapshot, ConnectionState, ConnectionStats};
pub use error::{FailureDescriptor, FailureKind, PrivchatSyncError, Result};
pub use events::{EventFilter, EventManager, EventStats, FilteredEventReceiver, SyncEvent};
pub use network::{ConnectivityMonitor, NetworkStatus, NetworkStatusEvent, OnlineStateEvent, PlatformConnectivity};
pub use push_dispatcher::{ChangeEvent, ChangeKind, ChangeListener, ChangePayload, DispatchStats, ListenerId, PushDispatcher};
pub use request_correlator::{PendingResponse, RequestCorrelator};
pub use sdk::{PrivchatSync, PrivchatSyncBuilder, SyncState};
pub use sync::{
    DependencyResults, OperationId, OperationInfo, OperationKind, OperationRequest, Payload, QueueMetrics,
    QueueSnapshot, RequestMapper, RestRequestMapper, SlotState, SyncQueue, TransportHint,
};
pub use transport::{
    DirectRequest, DirectResponse, DirectTransport, InboundFrame, OutboundFrame, PersistentChannel,
    PersistentConnector, PushFrame, ResponseFrame, ReqwestDirectTransport, WebSocketConnector,
};
pub use version::SDK_VERSION;
