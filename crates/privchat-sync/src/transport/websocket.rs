use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{PersistentChannel, PersistentConnector};
use crate::error::{PrivchatSyncError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 基于 tokio-tungstenite 的长连接建连器
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PersistentConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PersistentChannel>> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| PrivchatSyncError::Transport(format!("WebSocket 建连失败 {}: {}", url, e)))?;
        info!("WebSocket 已连接: {} (HTTP {})", url, response.status());

        let (sink, stream) = stream.split();
        Ok(Box::new(WebSocketChannel { sink, stream }))
    }
}

/// WebSocket 长连接
pub struct WebSocketChannel {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl PersistentChannel for WebSocketChannel {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| PrivchatSyncError::Transport(format!("WebSocket 发送失败: {}", e)))?;
        // flush 才能及时发现连接已断开
        self.sink
            .flush()
            .await
            .map_err(|e| PrivchatSyncError::Transport(format!("WebSocket 发送失败: {}", e)))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_string())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => debug!("忽略非 UTF-8 的二进制帧 ({} bytes)", bytes.len()),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("服务端关闭 WebSocket: {:?}", frame);
                    return Ok(None);
                }
                // 协议层 ping/pong 由 tungstenite 处理
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(PrivchatSyncError::Transport(format!("WebSocket 接收失败: {}", e)));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| PrivchatSyncError::Transport(format!("WebSocket 关闭失败: {}", e)))
    }
}
