//! 连通性监控
//!
//! 汇总两类信号得出"是否在线"的判断：
//! - 平台层网络状态（由 Android/iOS 等平台实现 [`PlatformConnectivity`] 提供，可选）
//! - 传输层观测（长连接建连失败、直连请求网络错误等）
//!
//! 平台报告离线时以平台为准；传输层的网络错误会让判断在
//! `transport_failure_hold_ms` 内保持离线，之后自动清除。
//! 判断翻转需要稳定 `settle_delay_ms`，期间翻回则不发布。
//! 监控本身不做任何重试。

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectivityConfig;
use crate::error::Result;
use crate::utils::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

impl NetworkStatus {
    /// 是否可以尝试网络请求
    pub fn is_usable(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 平台网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

/// 平台网络状态监听器（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait PlatformConnectivity: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 在线判断变更通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineStateEvent {
    pub online: bool,
    pub timestamp: u64,
}

#[derive(Debug, Default)]
struct SignalState {
    /// 最近一次平台信号；None 表示没有平台信号
    platform_online: Option<bool>,
    /// 传输层最近报告了网络错误
    transport_down: bool,
    transport_generation: u64,
    settle_generation: u64,
}

impl SignalState {
    fn raw_belief(&self) -> bool {
        match self.platform_online {
            Some(false) => false,
            _ => !self.transport_down,
        }
    }
}

#[derive(Debug)]
struct MonitorInner {
    config: ConnectivityConfig,
    signals: Mutex<SignalState>,
    belief: RwLock<bool>,
    sender: broadcast::Sender<OnlineStateEvent>,
    platform: Option<Arc<dyn PlatformConnectivity>>,
    platform_task: Mutex<Option<JoinHandle<()>>>,
}

/// 连通性监控器
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(config: ConnectivityConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_platform(config: ConnectivityConfig, platform: Arc<dyn PlatformConnectivity>) -> Self {
        Self::build(config, Some(platform))
    }

    fn build(config: ConnectivityConfig, platform: Option<Arc<dyn PlatformConnectivity>>) -> Self {
        let (sender, _) = broadcast::channel(64);
        let initial = config.initial_online;
        Self {
            inner: Arc::new(MonitorInner {
                config,
                signals: Mutex::new(SignalState::default()),
                belief: RwLock::new(initial),
                sender,
                platform,
                platform_task: Mutex::new(None),
            }),
        }
    }

    /// 启动平台信号监听；没有平台监听器时只按已有信号重新计算一次
    pub async fn start(&self) -> Result<()> {
        let platform = match &self.inner.platform {
            Some(platform) => platform.clone(),
            None => {
                self.reevaluate();
                return Ok(());
            }
        };

        // 初始状态直接采用，不走防抖
        let status = platform.current_status().await;
        {
            let mut signals = self.inner.signals.lock();
            signals.platform_online = Some(status.is_usable());
            let raw = signals.raw_belief();
            drop(signals);
            self.publish(raw);
        }
        info!("平台网络状态: {:?}", status);

        let mut receiver = platform.start_monitoring().await?;
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => monitor.report_platform_status(event.new_status),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("平台网络事件积压，丢弃 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("平台网络监听已结束");
        });
        if let Some(previous) = self.inner.platform_task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// 停止平台信号监听
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.platform_task.lock().take() {
            handle.abort();
        }
        if let Some(platform) = &self.inner.platform {
            platform.stop_monitoring().await;
        }
    }

    /// 当前在线判断
    pub fn is_online(&self) -> bool {
        *self.inner.belief.read()
    }

    /// 订阅在线判断变更
    pub fn subscribe(&self) -> broadcast::Receiver<OnlineStateEvent> {
        self.inner.sender.subscribe()
    }

    /// 等待直到判断为在线
    pub async fn wait_until_online(&self) {
        let mut receiver = self.subscribe();
        if self.is_online() {
            return;
        }
        loop {
            match receiver.recv().await {
                Ok(event) if event.online => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.is_online() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// 平台层上报网络状态
    pub fn report_platform_status(&self, status: NetworkStatus) {
        debug!("收到平台网络状态: {:?}", status);
        self.inner.signals.lock().platform_online = Some(status.is_usable());
        self.reevaluate();
    }

    /// 传输层上报网络级错误（没有收到任何响应）
    pub fn report_transport_failure(&self, source: &str) {
        let generation = {
            let mut signals = self.inner.signals.lock();
            signals.transport_down = true;
            signals.transport_generation += 1;
            signals.transport_generation
        };
        debug!("传输层网络错误: source={}", source);

        let hold = Duration::from_millis(self.inner.config.transport_failure_hold_ms);
        let monitor = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(hold).await;
                    monitor.clear_transport_failure(generation);
                });
            }
            Err(_) => warn!("没有 tokio 运行时，传输层离线判断不会自动清除"),
        }
        self.reevaluate();
    }

    /// 传输层上报成功（建连成功、收到响应）
    pub fn report_transport_success(&self) {
        let changed = {
            let mut signals = self.inner.signals.lock();
            let was_down = signals.transport_down;
            signals.transport_down = false;
            signals.transport_generation += 1;
            was_down
        };
        if changed {
            self.reevaluate();
        }
    }

    fn clear_transport_failure(&self, generation: u64) {
        {
            let mut signals = self.inner.signals.lock();
            if signals.transport_generation != generation {
                return;
            }
            signals.transport_down = false;
        }
        self.reevaluate();
    }

    /// 重新计算判断；翻转需要稳定一段时间才发布
    fn reevaluate(&self) {
        let (raw, generation) = {
            let mut signals = self.inner.signals.lock();
            signals.settle_generation += 1;
            (signals.raw_belief(), signals.settle_generation)
        };
        if raw == self.is_online() {
            return;
        }

        let settle = Duration::from_millis(self.inner.config.settle_delay_ms);
        if settle.is_zero() {
            self.publish(raw);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let monitor = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(settle).await;
                    let current = {
                        let signals = monitor.inner.signals.lock();
                        if signals.settle_generation != generation {
                            return;
                        }
                        signals.raw_belief()
                    };
                    monitor.publish(current);
                });
            }
            Err(_) => self.publish(raw),
        }
    }

    fn publish(&self, online: bool) {
        {
            let mut belief = self.inner.belief.write();
            if *belief == online {
                return;
            }
            *belief = online;
        }
        info!("在线判断变更: {}", if online { "在线" } else { "离线" });
        let _ = self.inner.sender.send(OnlineStateEvent {
            online,
            timestamp: now_millis(),
        });
    }
}
