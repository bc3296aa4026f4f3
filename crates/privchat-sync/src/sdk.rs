//! 同步核心入口
//!
//! [`PrivchatSync`] 组装各个组件并负责它们之间的连线：
//!
//! ```text
//! ConnectionManager ──ConnectionEvent──▶ InboundRouter ──响应──▶ RequestCorrelator
//!                                              │
//!                                              ├──推送──▶ PushDispatcher ──▶ ChangeListener
//!                                              └──Opened──▶ SyncQueue（提前重试）
//! ConnectivityMonitor ──OnlineStateEvent──▶ SyncQueue / ConnectionManager / SyncEvent
//! ```

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::PrivchatSyncConfig;
use crate::connection_manager::{ConnectionEvent, ConnectionManager};
use crate::connection_state::{ConnectionSnapshot, ConnectionState};
use crate::error::{PrivchatSyncError, Result};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SyncEvent};
use crate::network::{ConnectivityMonitor, NetworkStatus, OnlineStateEvent, PlatformConnectivity};
use crate::push_dispatcher::{ChangeListener, DispatchStats, ListenerId, PushDispatcher};
use crate::request_correlator::RequestCorrelator;
use crate::sync::{
    OperationId, OperationRequest, QueueContext, QueueSnapshot, RequestMapper, RestRequestMapper, SyncQueue,
};
use crate::transport::{DirectTransport, InboundFrame, PersistentConnector, ReqwestDirectTransport, WebSocketConnector};

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// 已创建，尚未启动
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// 构造器：可替换各个外部依赖，未指定时使用默认实现
pub struct PrivchatSyncBuilder {
    config: PrivchatSyncConfig,
    connector: Option<Arc<dyn PersistentConnector>>,
    direct: Option<Arc<dyn DirectTransport>>,
    platform: Option<Arc<dyn PlatformConnectivity>>,
    mapper: Option<Arc<dyn RequestMapper>>,
}

impl PrivchatSyncBuilder {
    pub fn new(config: PrivchatSyncConfig) -> Self {
        Self {
            config,
            connector: None,
            direct: None,
            platform: None,
            mapper: None,
        }
    }

    /// 长连接建连器（默认 WebSocket）
    pub fn connector(mut self, connector: Arc<dyn PersistentConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// 直连传输（默认 reqwest）
    pub fn direct_transport(mut self, direct: Arc<dyn DirectTransport>) -> Self {
        self.direct = Some(direct);
        self
    }

    /// 平台网络状态监听器（默认没有，只依赖传输层信号）
    pub fn platform(mut self, platform: Arc<dyn PlatformConnectivity>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// 请求映射（默认 REST 风格）
    pub fn request_mapper(mut self, mapper: Arc<dyn RequestMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// 组装所有组件并启动后台任务，必须在 tokio 运行时内调用
    ///
    /// 连接在 [`PrivchatSync::start`] 之后才会建立；在此之前入队的操作会走直连。
    pub fn build(self) -> Result<PrivchatSync> {
        let config = self.config;
        config.validate()?;
        info!("正在初始化同步核心...");

        let direct: Arc<dyn DirectTransport> = match self.direct {
            Some(direct) => direct,
            None => Arc::new(ReqwestDirectTransport::new(
                config.direct_timeout(),
                Duration::from_millis(config.reconnect.connect_timeout_ms),
            )?),
        };
        let connector: Arc<dyn PersistentConnector> = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let mapper: Arc<dyn RequestMapper> = self.mapper.unwrap_or_else(|| {
            Arc::new(RestRequestMapper::new(
                config.server.api_base_url.clone(),
                config.server.default_headers.clone(),
            ))
        });

        // === 第1层：事件与连通性 ===
        let events = EventManager::new(config.events.buffer_size);
        let monitor = match self.platform {
            Some(platform) => ConnectivityMonitor::with_platform(config.connectivity.clone(), platform),
            None => ConnectivityMonitor::new(config.connectivity.clone()),
        };

        // === 第2层：长连接与请求关联 ===
        let (connection, connection_rx) = ConnectionManager::spawn(
            config.server.channel_url.clone(),
            connector,
            monitor.clone(),
            config.reconnect.clone(),
            config.heartbeat.clone(),
            events.clone(),
        );
        let correlator = RequestCorrelator::new(connection.clone(), config.request_timeout());
        let dispatcher = Arc::new(PushDispatcher::new());

        // === 第3层：同步队列 ===
        let (queue, queue_task) = SyncQueue::spawn(QueueContext {
            retry: config.retry.clone(),
            queue: config.queue.clone(),
            monitor: monitor.clone(),
            correlator: Some(correlator.clone()),
            direct,
            mapper,
            events: events.clone(),
        });

        // === 第4层：入站路由 ===
        let router = InboundRouter {
            connection_rx,
            online_rx: monitor.subscribe(),
            online_open: true,
            correlator: correlator.clone(),
            dispatcher: dispatcher.clone(),
            queue: queue.clone(),
            events: events.clone(),
        };
        let router_task = tokio::spawn(router.run());

        info!("✅ 同步核心初始化完成");
        Ok(PrivchatSync {
            config,
            monitor,
            connection,
            correlator,
            dispatcher,
            queue,
            events,
            state: RwLock::new(SyncState::Created),
            tasks: Mutex::new(vec![router_task, queue_task]),
        })
    }
}

/// 同步核心
pub struct PrivchatSync {
    config: PrivchatSyncConfig,
    monitor: ConnectivityMonitor,
    connection: Arc<ConnectionManager>,
    correlator: RequestCorrelator,
    dispatcher: Arc<PushDispatcher>,
    queue: SyncQueue,
    events: EventManager,
    state: RwLock<SyncState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PrivchatSync {
    pub fn builder(config: PrivchatSyncConfig) -> PrivchatSyncBuilder {
        PrivchatSyncBuilder::new(config)
    }

    /// 使用默认传输实现创建
    pub fn new(config: PrivchatSyncConfig) -> Result<Self> {
        PrivchatSyncBuilder::new(config).build()
    }

    /// 启动平台网络监听并建立长连接
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            SyncState::Created => {}
            SyncState::Running => return Ok(()),
            SyncState::ShuttingDown | SyncState::Stopped => {
                return Err(PrivchatSyncError::ShuttingDown("同步核心已关闭".to_string()));
            }
        }
        self.monitor.start().await?;
        self.connection.connect();
        *self.state.write() = SyncState::Running;
        info!("同步核心已启动, online={}", self.monitor.is_online());
        Ok(())
    }

    /// 入队一个写操作
    pub async fn enqueue(&self, request: OperationRequest) -> Result<OperationId> {
        self.queue.enqueue(request).await
    }

    /// 撤回尚未发送的操作
    pub async fn cancel(&self, id: &OperationId) -> Result<()> {
        self.queue.cancel(id).await
    }

    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    pub fn remove_change_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_events_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn subscribe_online_state(&self) -> broadcast::Receiver<OnlineStateEvent> {
        self.monitor.subscribe()
    }

    /// 平台层主动上报网络状态（没有注册 [`PlatformConnectivity`] 时使用）
    pub fn report_network_status(&self, status: NetworkStatus) {
        self.monitor.report_platform_status(status);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state_tracker().state()
    }

    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        self.queue.snapshot().await
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// 等待中的长连接请求数
    pub fn pending_channel_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn config(&self) -> &PrivchatSyncConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// 关闭：未完成的操作以 `Cancelled` 失败，关闭长连接并停止后台任务
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if matches!(*state, SyncState::ShuttingDown | SyncState::Stopped) {
                return Ok(());
            }
            *state = SyncState::ShuttingDown;
        }
        info!("正在关闭同步核心...");

        if let Err(e) = self.queue.shutdown().await {
            debug!("同步队列已经停止: {}", e);
        }
        self.connection.shutdown().await;
        self.correlator.fail_all("同步核心已关闭");
        self.monitor.stop().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        *self.state.write() = SyncState::Stopped;
        info!("✅ 同步核心已关闭");
        Ok(())
    }
}

impl Drop for PrivchatSync {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// 入站路由：把长连接事件分给关联器、分发器和队列
struct InboundRouter {
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    online_rx: broadcast::Receiver<OnlineStateEvent>,
    online_open: bool,
    correlator: RequestCorrelator,
    dispatcher: Arc<PushDispatcher>,
    queue: SyncQueue,
    events: EventManager,
}

impl InboundRouter {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.connection_rx.recv() => match event {
                    Some(event) => self.route(event),
                    None => break,
                },
                online = self.online_rx.recv(), if self.online_open => match online {
                    Ok(event) => self.events.emit(SyncEvent::OnlineStateChanged {
                        online: event.online,
                        timestamp: event.timestamp,
                    }),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("在线状态事件积压，丢弃 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => self.online_open = false,
                },
            }
        }
        debug!("入站路由已结束");
    }

    fn route(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                self.queue.notify_connection_restored();
            }
            ConnectionEvent::Closed { reason, unexpected } => {
                let failed = self.correlator.fail_all(&reason);
                if unexpected {
                    warn!("长连接异常断开: {} ({} 个请求受影响)", reason, failed);
                } else {
                    debug!("长连接已关闭: {}", reason);
                }
            }
            ConnectionEvent::Message(text) => match InboundFrame::parse(&text) {
                Ok(frame) => {
                    if let Some(unmatched) = self.correlator.handle_inbound(frame) {
                        self.dispatcher.handle(unmatched);
                    }
                }
                Err(_) => self.dispatcher.handle_raw(&text),
            },
        }
    }
}
