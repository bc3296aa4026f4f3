//! 测试用的内存传输实现

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection_manager::FrameSender;
use crate::connection_state::ConnectionState;
use crate::error::{FailureDescriptor, PrivchatSyncError, Result};
use crate::sync::operation::{OperationId, OperationRequest};
use crate::transport::{
    DirectRequest, DirectResponse, DirectTransport, OutboundFrame, PersistentChannel, PersistentConnector,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 直连脚本中的一次回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Status(u16, Value),
    NetworkError,
    /// 永远不返回
    Hang,
}

/// 按脚本回复的直连实现；脚本用完后一律返回 200
#[derive(Debug, Default)]
pub struct ScriptedDirectTransport {
    script: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<(Instant, DirectRequest)>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedDirectTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.script.lock().push_back(reply);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn requests(&self) -> Vec<DirectRequest> {
        self.requests.lock().iter().map(|(_, request)| request.clone()).collect()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectTransport for ScriptedDirectTransport {
    async fn execute(&self, request: DirectRequest) -> Result<DirectResponse> {
        self.requests.lock().push((Instant::now(), request));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let reply = self.script.lock().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Some(ScriptedReply::Status(status, body)) => Ok(DirectResponse::new(status, body)),
            Some(ScriptedReply::NetworkError) => {
                Err(PrivchatSyncError::Transport("connection reset by peer".to_string()))
            }
            Some(ScriptedReply::Hang) => std::future::pending().await,
            None => Ok(DirectResponse::new(200, json!({ "ok": true }))),
        }
    }
}

/// 把帧写进 mpsc 的 FrameSender，状态可手动切换
#[derive(Debug)]
pub struct ChannelFrameSender {
    state: RwLock<ConnectionState>,
    frames: mpsc::UnboundedSender<String>,
}

impl ChannelFrameSender {
    pub fn new(state: ConnectionState) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (frames, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: RwLock::new(state),
                frames,
            }),
            receiver,
        )
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

impl FrameSender for ChannelFrameSender {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn send_frame(&self, text: String) -> Result<()> {
        if !self.state().is_open() {
            return Err(PrivchatSyncError::NotConnected);
        }
        self.frames
            .send(text)
            .map_err(|_| PrivchatSyncError::Transport("frame receiver dropped".to_string()))
    }
}

/// 内存长连接建连器；每次成功建连都会通过 receiver 交出服务端句柄
#[derive(Debug)]
pub struct MockConnector {
    accept: AtomicBool,
    attempts: AtomicUsize,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accept: AtomicBool::new(true),
                attempts: AtomicUsize::new(0),
                servers,
            }),
            receiver,
        )
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistentConnector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn PersistentChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.accept.load(Ordering::SeqCst) {
            return Err(PrivchatSyncError::Transport("connection refused".to_string()));
        }
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let _ = self.servers.send(MockServer { to_client, from_client });
        Ok(Box::new(MockChannel { to_server, from_server }))
    }
}

struct MockChannel {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<Option<String>>,
}

#[async_trait]
impl PersistentChannel for MockChannel {
    async fn send(&mut self, text: String) -> Result<()> {
        self.to_server
            .send(text)
            .map_err(|_| PrivchatSyncError::Transport("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.from_server.recv().await {
            Some(Some(text)) => Ok(Some(text)),
            Some(None) | None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 内存长连接的服务端
#[derive(Debug)]
pub struct MockServer {
    to_client: mpsc::UnboundedSender<Option<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Some(text.into()));
    }

    pub fn close(&self) {
        let _ = self.to_client.send(None);
    }

    pub async fn next_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// 下一个请求帧（跳过心跳）
    pub async fn next_request(&mut self) -> Option<OutboundFrame> {
        while let Some(text) = self.from_client.recv().await {
            if let Ok(frame) = serde_json::from_str::<OutboundFrame>(&text) {
                return Some(frame);
            }
        }
        None
    }

    pub fn respond(&self, correlation_id: &str, status_code: u16, body: Value) {
        self.push(json!({ "correlation_id": correlation_id, "status_code": status_code, "body": body }).to_string());
    }
}

pub type OperationOutcome = (OperationId, std::result::Result<Value, FailureDescriptor>);

/// 收集 on_complete / on_error 回调
#[derive(Debug)]
pub struct OutcomeRecorder {
    sender: mpsc::UnboundedSender<OperationOutcome>,
    receiver: mpsc::UnboundedReceiver<OperationOutcome>,
}

impl OutcomeRecorder {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver }
    }

    pub fn track(&self, request: OperationRequest) -> OperationRequest {
        let on_ok = self.sender.clone();
        let on_err = self.sender.clone();
        request
            .on_complete(move |id, value| {
                let _ = on_ok.send((id, Ok(value)));
            })
            .on_error(move |id, failure| {
                let _ = on_err.send((id, Err(failure)));
            })
    }

    pub async fn next(&mut self) -> Option<OperationOutcome> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<OperationOutcome> {
        self.receiver.try_recv().ok()
    }
}
