//! 传输层
//!
//! - 直连：[`DirectTransport`]，默认实现 [`ReqwestDirectTransport`]
//! - 长连接：[`PersistentConnector`] 建立 [`PersistentChannel`]，默认实现 [`WebSocketConnector`]
//!
//! 两者都只搬运文本/JSON，不关心业务语义。测试里用内存实现替换。

pub mod frame;
pub mod http;
pub mod websocket;

use async_trait::async_trait;

use crate::error::Result;

pub use frame::{DirectRequest, DirectResponse, InboundFrame, OutboundFrame, PushFrame, ResponseFrame};
pub use http::{DirectTransport, ReqwestDirectTransport};
pub use websocket::WebSocketConnector;

/// 一条已建立的长连接
///
/// `recv` 必须可以安全取消（连接管理器在 select 中轮询它）。
#[async_trait]
pub trait PersistentChannel: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// 接收下一帧；`Ok(None)` 表示对端正常关闭
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// 长连接建连器
#[async_trait]
pub trait PersistentConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PersistentChannel>>;
}
