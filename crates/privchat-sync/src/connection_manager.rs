//! 长连接管理
//!
//! 维护唯一的一条长连接：`CLOSED → CONNECTING → OPEN`，异常断开后在线时按指数退避重连，
//! 离线时不发起任何建连。所有状态变更都在后台任务里完成，其他组件只能读取状态、
//! 发送帧和消费 [`ConnectionEvent`]。

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::{HeartbeatConfig, ReconnectConfig};
use crate::connection_state::{ConnectionSnapshot, ConnectionState, ConnectionStateTracker};
use crate::error::{PrivchatSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::network::{ConnectivityMonitor, OnlineStateEvent};
use crate::transport::frame::heartbeat_frame;
use crate::transport::{PersistentChannel, PersistentConnector};
use crate::utils::now_millis;

/// 长连接事件，按发生顺序投递
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    Closed { reason: String, unexpected: bool },
    Message(String),
}

/// 向长连接写帧的能力
pub trait FrameSender: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// 连接不是 OPEN 时同步返回 `NotConnected`
    fn send_frame(&self, text: String) -> Result<()>;
}

enum ManagerCommand {
    Connect,
    Close { respond_to: oneshot::Sender<()> },
}

/// 长连接管理器
pub struct ConnectionManager {
    tracker: ConnectionStateTracker,
    outbound: mpsc::UnboundedSender<String>,
    commands: mpsc::UnboundedSender<ManagerCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// 启动后台任务；连接在调用 [`connect`](Self::connect) 之后才会建立
    pub fn spawn(
        url: String,
        connector: Arc<dyn PersistentConnector>,
        monitor: ConnectivityMonitor,
        reconnect: ReconnectConfig,
        heartbeat: HeartbeatConfig,
        events: EventManager,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let tracker = ConnectionStateTracker::new(url.clone());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = ConnectionWorker {
            url,
            connector,
            online_rx: monitor.subscribe(),
            monitor,
            tracker: tracker.clone(),
            events,
            reconnect,
            heartbeat,
            outbound_rx,
            command_rx,
            event_tx,
            desired: false,
        };
        let task = tokio::spawn(worker.run());

        let manager = Arc::new(Self {
            tracker,
            outbound,
            commands,
            task: Mutex::new(Some(task)),
        });
        (manager, event_rx)
    }

    /// 请求建立连接；之后连接断开会自动重连，直到调用 [`close`](Self::close)
    pub fn connect(&self) {
        if self.commands.send(ManagerCommand::Connect).is_err() {
            warn!("连接管理任务已退出，忽略 connect 请求");
        }
    }

    /// 关闭连接并停止重连
    pub async fn close(&self) {
        let (respond_to, response) = oneshot::channel();
        if self.commands.send(ManagerCommand::Close { respond_to }).is_ok() {
            let _ = response.await;
        }
    }

    /// 关闭连接并结束后台任务
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.close().await;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!("连接管理器已停止");
    }

    pub fn state_tracker(&self) -> &ConnectionStateTracker {
        &self.tracker
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.tracker.snapshot()
    }
}

impl FrameSender for ConnectionManager {
    fn state(&self) -> ConnectionState {
        self.tracker.state()
    }

    fn send_frame(&self, text: String) -> Result<()> {
        if !self.tracker.state().is_open() {
            return Err(PrivchatSyncError::NotConnected);
        }
        self.outbound
            .send(text)
            .map_err(|_| PrivchatSyncError::ConnectionLost("连接管理任务已退出".to_string()))
    }
}

/// 一次 OPEN 状态的结束方式
enum OpenOutcome {
    Unexpected(String),
    Requested(oneshot::Sender<()>),
    Shutdown,
}

struct ConnectionWorker {
    url: String,
    connector: Arc<dyn PersistentConnector>,
    monitor: ConnectivityMonitor,
    online_rx: broadcast::Receiver<OnlineStateEvent>,
    tracker: ConnectionStateTracker,
    events: EventManager,
    reconnect: ReconnectConfig,
    heartbeat: HeartbeatConfig,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    command_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// 调用方希望保持连接
    desired: bool,
}

impl ConnectionWorker {
    async fn run(mut self) {
        info!("连接管理任务已启动: {}", self.url);
        loop {
            if !self.desired {
                match self.command_rx.recv().await {
                    Some(command) => self.handle_idle_command(command),
                    None => break,
                }
                continue;
            }

            if !self.monitor.is_online() {
                if !self.wait_for_online().await {
                    break;
                }
                continue;
            }

            let channel = match self.try_connect().await {
                Some(Ok(channel)) => channel,
                Some(Err(reason)) => {
                    let failures = self.tracker.record_failure(&reason);
                    self.set_state(ConnectionState::Closed);
                    self.monitor.report_transport_failure("channel");
                    warn!("长连接建连失败（连续 {} 次）: {}", failures, reason);
                    if !self.wait_before_reconnect(failures).await {
                        break;
                    }
                    continue;
                }
                // 建连期间被关闭
                None => continue,
            };

            // 上一条连接遗留的帧不能发到新连接上
            self.drain_outbound();
            self.set_state(ConnectionState::Open);
            self.monitor.report_transport_success();
            let _ = self.event_tx.send(ConnectionEvent::Opened);
            info!("{}", self.tracker.snapshot().summary());

            match self.run_open(channel).await {
                OpenOutcome::Unexpected(reason) => {
                    let failures = self.tracker.record_failure(&reason);
                    self.set_state(ConnectionState::Closed);
                    self.drain_outbound();
                    warn!("长连接异常断开: {}", reason);
                    let _ = self.event_tx.send(ConnectionEvent::Closed {
                        reason,
                        unexpected: true,
                    });
                    if !self.wait_before_reconnect(failures).await {
                        break;
                    }
                }
                OpenOutcome::Requested(respond_to) => {
                    self.finish_requested_close("调用方关闭");
                    let _ = respond_to.send(());
                }
                OpenOutcome::Shutdown => {
                    self.finish_requested_close("连接管理器已释放");
                    break;
                }
            }
        }
        debug!("连接管理任务已结束");
    }

    fn handle_idle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Connect => self.desired = true,
            ManagerCommand::Close { respond_to } => {
                self.desired = false;
                let _ = respond_to.send(());
            }
        }
    }

    /// 离线时等待在线判断恢复；返回 false 表示任务应当结束
    async fn wait_for_online(&mut self) -> bool {
        debug!("离线，暂停建连");
        tokio::select! {
            event = self.online_rx.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = event {
                    return false;
                }
                true
            }
            command = self.command_rx.recv() => match command {
                Some(command) => {
                    self.handle_idle_command(command);
                    true
                }
                None => false,
            },
        }
    }

    /// 建连；期间收到 close 会放弃本次建连并返回 None
    async fn try_connect(&mut self) -> Option<std::result::Result<Box<dyn PersistentChannel>, String>> {
        self.set_state(ConnectionState::Connecting);
        let timeout = Duration::from_millis(self.reconnect.connect_timeout_ms);
        let connector = self.connector.clone();
        let url = self.url.clone();
        let connect = tokio::time::timeout(timeout, async move { connector.connect(&url).await });
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return Some(match result {
                        Ok(Ok(channel)) => Ok(channel),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("建连超时 ({:?})", timeout)),
                    });
                }
                command = self.command_rx.recv() => match command {
                    Some(ManagerCommand::Connect) => continue,
                    Some(ManagerCommand::Close { respond_to }) => {
                        self.desired = false;
                        self.finish_requested_close("建连期间被关闭");
                        let _ = respond_to.send(());
                        return None;
                    }
                    None => {
                        self.desired = false;
                        self.set_state(ConnectionState::Closed);
                        return None;
                    }
                },
            }
        }
    }

    async fn run_open(&mut self, mut channel: Box<dyn PersistentChannel>) -> OpenOutcome {
        let period = Duration::from_millis(self.heartbeat.interval_ms);
        let heartbeat_timeout = Duration::from_millis(self.heartbeat.timeout_ms);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                frame = channel.recv() => match frame {
                    Ok(Some(text)) => {
                        last_inbound = Instant::now();
                        self.tracker.increment_received(text.len());
                        self.monitor.report_transport_success();
                        let _ = self.event_tx.send(ConnectionEvent::Message(text));
                    }
                    Ok(None) => return OpenOutcome::Unexpected("对端关闭连接".to_string()),
                    Err(e) => {
                        self.monitor.report_transport_failure("channel");
                        return OpenOutcome::Unexpected(e.to_string());
                    }
                },
                Some(text) = self.outbound_rx.recv() => {
                    let size = text.len();
                    if let Err(e) = channel.send(text).await {
                        self.monitor.report_transport_failure("channel");
                        return OpenOutcome::Unexpected(e.to_string());
                    }
                    self.tracker.increment_sent(size);
                }
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= heartbeat_timeout {
                        return OpenOutcome::Unexpected(format!("心跳超时（{:?} 内没有收到任何帧）", heartbeat_timeout));
                    }
                    let frame = heartbeat_frame(now_millis());
                    let size = frame.len();
                    if let Err(e) = channel.send(frame).await {
                        self.monitor.report_transport_failure("channel");
                        return OpenOutcome::Unexpected(e.to_string());
                    }
                    self.tracker.increment_sent(size);
                    debug!("心跳已发送");
                }
                command = self.command_rx.recv() => match command {
                    Some(ManagerCommand::Connect) => {}
                    Some(ManagerCommand::Close { respond_to }) => {
                        self.desired = false;
                        self.close_channel(channel.as_mut()).await;
                        return OpenOutcome::Requested(respond_to);
                    }
                    None => {
                        self.desired = false;
                        self.close_channel(channel.as_mut()).await;
                        return OpenOutcome::Shutdown;
                    }
                },
            }
        }
    }

    async fn close_channel(&mut self, channel: &mut dyn PersistentChannel) {
        self.set_state(ConnectionState::Closing);
        if let Err(e) = channel.close().await {
            debug!("关闭长连接时出错: {}", e);
        }
    }

    /// 主动关闭后回到 CLOSED
    fn finish_requested_close(&mut self, reason: &str) {
        let state = self.tracker.state();
        let was_open = matches!(state, ConnectionState::Open | ConnectionState::Closing);
        if state != ConnectionState::Closed {
            self.set_state(ConnectionState::Closing);
        }
        self.tracker.record_close_reason(reason);
        self.set_state(ConnectionState::Closed);
        self.drain_outbound();
        if was_open {
            let _ = self.event_tx.send(ConnectionEvent::Closed {
                reason: reason.to_string(),
                unexpected: false,
            });
        }
        info!("长连接已关闭: {}", reason);
    }

    /// 断开后残留的待发帧直接丢弃，对应的请求由 correlator 统一失败
    fn drain_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("丢弃 {} 个未发送的帧", dropped);
        }
    }

    /// 重连前等待退避时间；返回 false 表示任务应当结束
    async fn wait_before_reconnect(&mut self, consecutive_failures: u32) -> bool {
        if !self.desired {
            return true;
        }
        let delay = self
            .reconnect
            .backoff
            .delay_for(consecutive_failures.saturating_sub(1));
        info!("{:?} 后重连（连续失败 {} 次）", delay, consecutive_failures);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.command_rx.recv() => match command {
                    Some(ManagerCommand::Connect) => continue,
                    Some(ManagerCommand::Close { respond_to }) => {
                        self.desired = false;
                        let _ = respond_to.send(());
                        return true;
                    }
                    None => return false,
                },
            }
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.tracker.transition(new_state);
        if old_state != new_state {
            debug!("长连接状态: {} -> {}", old_state, new_state);
            self.events.emit(SyncEvent::connection_changed(old_state, new_state));
        }
    }
}
