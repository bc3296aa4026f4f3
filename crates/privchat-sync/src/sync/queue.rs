//! 同步队列
//!
//! 单个后台任务按入队顺序串行发送操作，系统内同一时刻最多一个操作在发送：
//!
//! - 只有 `depends_on` 全部成功的最早操作才可以发送
//! - 可重试失败留在原位等待退避，退避期间也占用发送槽位，保证顺序
//! - 最终失败会级联失败所有（传递）依赖它的操作
//! - 离线时不发送也不失败，恢复在线后继续
//!
//! 所有状态变更都经过同一个任务：入队、撤回、尝试结果、退避到期、
//! 在线变化和连接恢复通知都是发给它的消息。

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use crate::config::{QueueConfig, RetryConfig};
use crate::error::{FailureDescriptor, FailureKind, PrivchatSyncError, Result};
use crate::events::{EventManager, SyncEvent};
use crate::network::{ConnectivityMonitor, OnlineStateEvent};
use crate::request_correlator::RequestCorrelator;
use crate::sync::operation::{
    DependencyResults, OperationId, OperationInfo, OperationRequest, SyncOperation, TransportHint,
};
use crate::sync::request_mapper::RequestMapper;
use crate::sync::retry_policy::{RetryDecision, RetryManager};
use crate::transport::DirectTransport;
use crate::utils::now_millis;

/// 队列依赖的组件
#[derive(Clone)]
pub struct QueueContext {
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub monitor: ConnectivityMonitor,
    /// 没有长连接时为 None，所有操作走直连
    pub correlator: Option<RequestCorrelator>,
    pub direct: Arc<dyn DirectTransport>,
    pub mapper: Arc<dyn RequestMapper>,
    pub events: EventManager,
}

/// 发送槽位状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SlotState {
    Idle,
    InFlight {
        id: OperationId,
        attempt: u32,
        transport: TransportHint,
    },
    Backoff {
        id: OperationId,
        retry_count: u32,
    },
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    /// 因依赖失败或撤回而级联失败
    pub cascaded: u64,
    pub cancelled: u64,
}

/// 队列快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// 按入队顺序排列的未结束操作（包括正在发送的）
    pub pending: Vec<OperationInfo>,
    pub slot: SlotState,
    pub metrics: QueueMetrics,
    pub online: bool,
}

impl QueueSnapshot {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 最早入队的未结束操作
    pub fn head(&self) -> Option<&OperationInfo> {
        self.pending.first()
    }
}

enum QueueCommand {
    Enqueue {
        request: OperationRequest,
        respond_to: oneshot::Sender<Result<OperationId>>,
    },
    Cancel {
        id: OperationId,
        respond_to: oneshot::Sender<Result<()>>,
    },
    ConnectionRestored,
    Snapshot {
        respond_to: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// 同步队列句柄
#[derive(Debug, Clone)]
pub struct SyncQueue {
    commands: mpsc::UnboundedSender<QueueCommand>,
}

impl std::fmt::Debug for QueueCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueueCommand::Enqueue { .. } => "Enqueue",
            QueueCommand::Cancel { .. } => "Cancel",
            QueueCommand::ConnectionRestored => "ConnectionRestored",
            QueueCommand::Snapshot { .. } => "Snapshot",
            QueueCommand::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SyncQueue {
    /// 启动队列任务
    pub fn spawn(context: QueueContext) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let worker = QueueWorker {
            retry: RetryManager::new(&context.retry),
            ledger: TerminalLedger::new(context.queue.terminal_history_limit),
            online_rx: context.monitor.subscribe(),
            online_open: true,
            context,
            commands: command_rx,
            outcomes_tx,
            outcomes_rx,
            pending: VecDeque::new(),
            slot: Slot::Idle,
            delays: DelayQueue::new(),
            metrics: QueueMetrics::default(),
            next_token: 0,
            shutting_down: false,
        };
        let task = tokio::spawn(worker.run());
        (Self { commands }, task)
    }

    /// 入队；参数不合法时立即返回错误
    pub async fn enqueue(&self, request: OperationRequest) -> Result<OperationId> {
        let (respond_to, response) = oneshot::channel();
        self.send(QueueCommand::Enqueue { request, respond_to })?;
        response.await.map_err(|_| Self::stopped())?
    }

    /// 撤回尚未发送（或正在等待重试）的操作，依赖它的操作会以 `Cancelled` 失败
    pub async fn cancel(&self, id: &OperationId) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(QueueCommand::Cancel {
            id: id.clone(),
            respond_to,
        })?;
        response.await.map_err(|_| Self::stopped())?
    }

    /// 长连接重新建立
    pub fn notify_connection_restored(&self) {
        let _ = self.commands.send(QueueCommand::ConnectionRestored);
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let (respond_to, response) = oneshot::channel();
        self.send(QueueCommand::Snapshot { respond_to })?;
        response.await.map_err(|_| Self::stopped())
    }

    /// 停止队列，所有未结束的操作以 `Cancelled` 失败
    pub async fn shutdown(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(QueueCommand::Shutdown { respond_to })?;
        response.await.map_err(|_| Self::stopped())
    }

    fn send(&self, command: QueueCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Self::stopped())
    }

    fn stopped() -> PrivchatSyncError {
        PrivchatSyncError::ShuttingDown("同步队列已停止".to_string())
    }
}

/// 一次尝试的结果
#[derive(Debug)]
enum AttemptOutcome {
    Success(Value),
    Failure(FailureDescriptor),
}

struct AttemptResult {
    id: OperationId,
    token: u64,
    outcome: AttemptOutcome,
}

enum Slot {
    Idle,
    InFlight {
        id: OperationId,
        token: u64,
        attempt: u32,
        transport: TransportHint,
        handle: AbortHandle,
    },
    Backoff {
        id: OperationId,
        key: delay_queue::Key,
    },
}

/// 最近结束的操作记录
///
/// 仍被队列中操作依赖的记录不会被淘汰，直到最后一个依赖方离开队列。
struct TerminalLedger {
    limit: usize,
    order: VecDeque<OperationId>,
    succeeded: HashMap<OperationId, Value>,
    failed: HashSet<OperationId>,
    pins: HashMap<OperationId, usize>,
}

impl TerminalLedger {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            order: VecDeque::new(),
            succeeded: HashMap::new(),
            failed: HashSet::new(),
            pins: HashMap::new(),
        }
    }

    fn record_success(&mut self, id: OperationId, result: Value) {
        self.succeeded.insert(id.clone(), result);
        self.push(id);
    }

    fn record_failure(&mut self, id: OperationId) {
        self.failed.insert(id.clone());
        self.push(id);
    }

    fn push(&mut self, id: OperationId) {
        self.order.push_back(id);
        self.evict();
    }

    /// 有操作依赖 `id` 时调用，和 `unpin` 成对出现
    fn pin(&mut self, id: &OperationId) {
        *self.pins.entry(id.clone()).or_insert(0) += 1;
    }

    fn unpin(&mut self, id: &OperationId) {
        if let Some(count) = self.pins.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(id);
            }
        }
        self.evict();
    }

    /// 从最旧的开始淘汰，跳过被依赖的记录
    fn evict(&mut self) {
        let mut index = 0;
        while self.order.len() > self.limit && index < self.order.len() {
            if self.pins.contains_key(&self.order[index]) {
                index += 1;
                continue;
            }
            if let Some(evicted) = self.order.remove(index) {
                self.succeeded.remove(&evicted);
                self.failed.remove(&evicted);
            }
        }
    }

    fn result(&self, id: &OperationId) -> Option<&Value> {
        self.succeeded.get(id)
    }

    fn has_succeeded(&self, id: &OperationId) -> bool {
        self.succeeded.contains_key(id)
    }

    fn has_failed(&self, id: &OperationId) -> bool {
        self.failed.contains(id)
    }
}

struct QueueWorker {
    context: QueueContext,
    retry: RetryManager,
    commands: mpsc::UnboundedReceiver<QueueCommand>,
    outcomes_tx: mpsc::UnboundedSender<AttemptResult>,
    outcomes_rx: mpsc::UnboundedReceiver<AttemptResult>,
    online_rx: broadcast::Receiver<OnlineStateEvent>,
    online_open: bool,
    /// 按入队顺序排列，正在发送和等待重试的操作也在其中
    pending: VecDeque<SyncOperation>,
    slot: Slot,
    delays: DelayQueue<OperationId>,
    ledger: TerminalLedger,
    metrics: QueueMetrics,
    next_token: u64,
    shutting_down: bool,
}

impl QueueWorker {
    async fn run(mut self) {
        info!("同步队列已启动");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.cancel_all("同步队列已释放");
                        break;
                    }
                },
                Some(result) = self.outcomes_rx.recv() => self.handle_attempt_result(result),
                Some(expired) = self.delays.next(), if !self.delays.is_empty() => {
                    self.handle_backoff_elapsed(expired.into_inner());
                }
                event = self.online_rx.recv(), if self.online_open => self.handle_online_event(event),
            }
        }
        info!("同步队列已停止");
    }

    /// 返回 false 表示任务应当结束
    fn handle_command(&mut self, command: QueueCommand) -> bool {
        match command {
            QueueCommand::Enqueue { request, respond_to } => {
                let result = self.handle_enqueue(request);
                let _ = respond_to.send(result);
            }
            QueueCommand::Cancel { id, respond_to } => {
                let result = self.handle_cancel(id);
                let _ = respond_to.send(result);
            }
            QueueCommand::ConnectionRestored => {
                debug!("长连接已恢复，重新评估队列");
                self.expedite_retry(true);
                self.process_next();
            }
            QueueCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            QueueCommand::Shutdown { respond_to } => {
                self.cancel_all("同步队列已关闭");
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn handle_enqueue(&mut self, request: OperationRequest) -> Result<OperationId> {
        if self.shutting_down {
            return Err(PrivchatSyncError::ShuttingDown("同步队列正在关闭".to_string()));
        }
        let operation = SyncOperation::from_request(request)?;
        let id = operation.id.clone();

        if self.position(&id).is_some() || self.ledger.has_succeeded(&id) || self.ledger.has_failed(&id) {
            return Err(PrivchatSyncError::AlreadyExists(format!("操作 {} 已存在", id)));
        }
        for dependency in &operation.depends_on {
            if self.position(dependency).is_some() || self.ledger.has_succeeded(dependency) {
                continue;
            }
            if self.ledger.has_failed(dependency) {
                return Err(PrivchatSyncError::InvalidOperation(format!(
                    "操作 {} 依赖的 {} 已经失败",
                    id, dependency
                )));
            }
            return Err(PrivchatSyncError::NotFound(format!("操作 {} 依赖的 {} 不存在", id, dependency)));
        }

        debug!(
            "操作入队: {} {} {} (依赖 {} 个)",
            id,
            operation.kind,
            operation.target,
            operation.depends_on.len()
        );
        self.context.events.emit(SyncEvent::OperationEnqueued {
            id: id.clone(),
            kind: operation.kind,
            target: operation.target.clone(),
            timestamp: now_millis(),
        });
        for dependency in &operation.depends_on {
            self.ledger.pin(dependency);
        }
        self.pending.push_back(operation);
        self.metrics.enqueued += 1;
        self.process_next();
        Ok(id)
    }

    fn handle_cancel(&mut self, id: OperationId) -> Result<()> {
        if matches!(&self.slot, Slot::InFlight { id: current, .. } if *current == id) {
            return Err(PrivchatSyncError::InvalidOperation(format!("操作 {} 正在发送，无法撤回", id)));
        }
        let retry_count = match self.position(&id) {
            Some(index) => self.pending[index].retry_count,
            None => return Err(PrivchatSyncError::NotFound(format!("操作 {} 不在队列中", id))),
        };

        self.take_backoff(&id);
        info!("撤回操作: {}", id);
        let failure = FailureDescriptor::new(FailureKind::Cancelled, "操作已被撤回").with_attempts(retry_count);
        self.fail_terminal(&id, failure);
        self.process_next();
        Ok(())
    }

    fn handle_online_event(&mut self, event: std::result::Result<OnlineStateEvent, broadcast::error::RecvError>) {
        let online = match event {
            Ok(event) => event.online,
            Err(broadcast::error::RecvError::Lagged(_)) => self.context.monitor.is_online(),
            Err(broadcast::error::RecvError::Closed) => {
                self.online_open = false;
                return;
            }
        };
        if online {
            info!("恢复在线，继续处理 {} 个待发送操作", self.pending.len());
            self.expedite_retry(false);
            self.process_next();
        } else {
            info!("离线，暂停发送（{} 个待发送操作）", self.pending.len());
        }
    }

    fn handle_backoff_elapsed(&mut self, id: OperationId) {
        if !matches!(&self.slot, Slot::Backoff { id: current, .. } if *current == id) {
            return;
        }
        self.slot = Slot::Idle;
        debug!("退避结束，重试: {}", id);
        self.process_next();
    }

    /// 结束正在进行的退避，立即重试
    fn expedite_retry(&mut self, persistent_only: bool) {
        let id = match &self.slot {
            Slot::Backoff { id, .. } => id.clone(),
            _ => return,
        };
        if persistent_only {
            let hint = self.position(&id).map(|index| self.pending[index].transport_hint);
            if hint != Some(TransportHint::Persistent) {
                return;
            }
        }
        if self.take_backoff(&id) {
            debug!("提前结束退避: {}", id);
        }
    }

    fn take_backoff(&mut self, id: &OperationId) -> bool {
        if !matches!(&self.slot, Slot::Backoff { id: current, .. } if current == id) {
            return false;
        }
        if let Slot::Backoff { key, .. } = std::mem::replace(&mut self.slot, Slot::Idle) {
            self.delays.remove(&key);
        }
        true
    }

    /// 槽位空闲且在线时，发送最早的可发送操作
    fn process_next(&mut self) {
        while matches!(self.slot, Slot::Idle) && !self.shutting_down {
            if !self.context.monitor.is_online() {
                if !self.pending.is_empty() {
                    debug!("离线，{} 个操作等待发送", self.pending.len());
                }
                return;
            }
            let Some(index) = self.next_eligible() else {
                return;
            };
            self.dispatch(index);
        }
    }

    fn next_eligible(&self) -> Option<usize> {
        self.pending.iter().position(|operation| {
            operation
                .depends_on
                .iter()
                .all(|dependency| self.position(dependency).is_none())
        })
    }

    fn dispatch(&mut self, index: usize) {
        let operation = &self.pending[index];
        let id = operation.id.clone();
        let attempt = operation.retry_count + 1;
        let dependencies = DependencyResults::new(
            operation
                .depends_on
                .iter()
                .filter_map(|dependency| {
                    self.ledger
                        .result(dependency)
                        .map(|result| (dependency.clone(), result.clone()))
                })
                .collect(),
        );

        let (transport, attempt_future) = match self.prepare_attempt(operation, &dependencies) {
            Ok(prepared) => prepared,
            Err(failure) => {
                self.fail_terminal(&id, failure);
                return;
            }
        };

        self.next_token += 1;
        let token = self.next_token;
        let outcomes = self.outcomes_tx.clone();
        let result_id = id.clone();
        let task = tokio::spawn(async move {
            let outcome = attempt_future.await;
            let _ = outcomes.send(AttemptResult {
                id: result_id,
                token,
                outcome,
            });
        });

        debug!("发送操作: {} (第 {} 次, {:?})", id, attempt, transport);
        self.metrics.attempts += 1;
        self.context.events.emit(SyncEvent::OperationSending {
            id: id.clone(),
            attempt,
            transport,
            timestamp: now_millis(),
        });
        self.slot = Slot::InFlight {
            id,
            token,
            attempt,
            transport,
            handle: task.abort_handle(),
        };
    }

    /// 生成载荷并选择传输方式
    fn prepare_attempt(
        &self,
        operation: &SyncOperation,
        dependencies: &DependencyResults,
    ) -> std::result::Result<(TransportHint, BoxFuture<'static, AttemptOutcome>), FailureDescriptor> {
        let invalid = |e: PrivchatSyncError| {
            FailureDescriptor::new(FailureKind::InvalidPayload, format!("无法生成请求: {}", e))
                .with_attempts(operation.retry_count)
        };
        let payload = operation.payload.resolve(dependencies).map_err(invalid)?;

        if operation.transport_hint == TransportHint::Persistent {
            if let Some(correlator) = self.context.correlator.as_ref().filter(|c| c.is_available()) {
                let request = self
                    .context
                    .mapper
                    .channel_request(operation, payload.clone())
                    .map_err(invalid)?;
                match correlator.send(operation.id.as_str(), &request.operation, request.payload) {
                    Ok(pending) => {
                        let attempt: BoxFuture<'static, AttemptOutcome> = Box::pin(async move {
                            match pending.wait().await {
                                Ok(response) => classify_response(response.status_code, response.body),
                                Err(e) => AttemptOutcome::Failure(e.into()),
                            }
                        });
                        return Ok((TransportHint::Persistent, attempt));
                    }
                    Err(e) => debug!("长连接不可用（{}），改走直连: {}", e, operation.id),
                }
            }
        }

        let request = self.context.mapper.direct_request(operation, payload).map_err(invalid)?;
        let direct = self.context.direct.clone();
        let monitor = self.context.monitor.clone();
        let attempt: BoxFuture<'static, AttemptOutcome> = Box::pin(async move {
            match direct.execute(request).await {
                Ok(response) => {
                    monitor.report_transport_success();
                    classify_response(response.status_code, response.body)
                }
                Err(e) => {
                    if e.is_network_level() {
                        monitor.report_transport_failure("direct");
                    }
                    AttemptOutcome::Failure(e.into())
                }
            }
        });
        Ok((TransportHint::Direct, attempt))
    }

    fn handle_attempt_result(&mut self, result: AttemptResult) {
        let attempt = match &self.slot {
            Slot::InFlight { id, token, attempt, .. } if *id == result.id && *token == result.token => *attempt,
            _ => {
                debug!("忽略过期的尝试结果: {}", result.id);
                return;
            }
        };
        self.slot = Slot::Idle;
        let Some(index) = self.position(&result.id) else {
            return;
        };

        match result.outcome {
            AttemptOutcome::Success(value) => self.complete(index, value, attempt),
            AttemptOutcome::Failure(failure) => {
                if self.handle_failure(index, failure, attempt) {
                    return;
                }
            }
        }
        self.process_next();
    }

    fn complete(&mut self, index: usize, result: Value, attempts: u32) {
        let Some(mut operation) = self.pending.remove(index) else {
            return;
        };
        info!("操作完成: {} ({} 次尝试)", operation.id, attempts);
        self.ledger.record_success(operation.id.clone(), result.clone());
        self.release_dependencies(&operation);
        self.metrics.succeeded += 1;
        self.context.events.emit(SyncEvent::OperationCompleted {
            id: operation.id.clone(),
            attempts,
            timestamp: now_millis(),
        });
        operation.complete(result);
    }

    /// 处理失败；安排了重试时返回 true
    fn handle_failure(&mut self, index: usize, failure: FailureDescriptor, attempt: u32) -> bool {
        let operation = &mut self.pending[index];
        let id = operation.id.clone();

        match self.retry.handle_failure(operation.retry_count, &failure) {
            RetryDecision::Retry { retry_count, delay } => {
                operation.retry_count = retry_count;
                let key = self.delays.insert(id.clone(), delay);
                self.slot = Slot::Backoff { id: id.clone(), key };
                self.metrics.retries += 1;
                warn!(
                    "操作失败，{:?} 后重试: {} (第 {} 次尝试, {})",
                    delay, id, attempt, failure
                );
                self.context.events.emit(SyncEvent::OperationRetrying {
                    id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    failure,
                    timestamp: now_millis(),
                });
                true
            }
            RetryDecision::Exhausted => {
                let exhausted = self.retry.exhausted_failure(&failure, attempt);
                self.fail_terminal(&id, exhausted);
                false
            }
            RetryDecision::Terminal => {
                self.fail_terminal(&id, failure.with_attempts(attempt));
                false
            }
        }
    }

    /// 最终失败：先级联失败所有依赖它的操作，再通知它自己
    fn fail_terminal(&mut self, id: &OperationId, failure: FailureDescriptor) {
        let Some(index) = self.position(id) else {
            return;
        };
        let Some(mut failed) = self.pending.remove(index) else {
            return;
        };

        // 依赖只能指向更早入队的操作，顺序扫描一遍即可覆盖传递依赖
        let mut doomed: HashSet<OperationId> = HashSet::new();
        doomed.insert(id.clone());
        let mut dependents = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.pending.len());
        for operation in self.pending.drain(..) {
            if operation.depends_on.iter().any(|dependency| doomed.contains(dependency)) {
                doomed.insert(operation.id.clone());
                dependents.push(operation);
            } else {
                remaining.push_back(operation);
            }
        }
        self.pending = remaining;

        let cascade_kind = if failure.kind == FailureKind::Cancelled {
            FailureKind::Cancelled
        } else {
            FailureKind::DependencyFailed
        };
        for mut dependent in dependents {
            let cascaded = FailureDescriptor::new(
                cascade_kind,
                format!("依赖的操作 {} 已失败 ({})", id, failure.kind),
            )
            .with_cause(id.clone())
            .with_attempts(dependent.retry_count);
            self.metrics.cascaded += 1;
            self.record_failure(&mut dependent, cascaded);
        }
        self.record_failure(&mut failed, failure);
    }

    fn record_failure(&mut self, operation: &mut SyncOperation, failure: FailureDescriptor) {
        if failure.kind == FailureKind::Cancelled {
            self.metrics.cancelled += 1;
            info!("操作已取消: {} - {}", operation.id, failure.message);
        } else {
            error!("操作最终失败: {} - {}", operation.id, failure);
        }
        self.metrics.failed += 1;
        self.ledger.record_failure(operation.id.clone());
        self.release_dependencies(operation);
        self.context.events.emit(SyncEvent::OperationFailed {
            id: operation.id.clone(),
            failure: failure.clone(),
            timestamp: now_millis(),
        });
        operation.fail(failure);
    }

    fn cancel_all(&mut self, reason: &str) {
        self.shutting_down = true;
        if let Slot::InFlight { handle, .. } = std::mem::replace(&mut self.slot, Slot::Idle) {
            handle.abort();
        }
        self.delays.clear();

        let operations: Vec<SyncOperation> = self.pending.drain(..).collect();
        if !operations.is_empty() {
            info!("{}，取消 {} 个未完成的操作", reason, operations.len());
        }
        for mut operation in operations {
            let failure = FailureDescriptor::new(FailureKind::Cancelled, reason).with_attempts(operation.retry_count);
            self.record_failure(&mut operation, failure);
        }
    }

    fn release_dependencies(&mut self, operation: &SyncOperation) {
        for dependency in &operation.depends_on {
            self.ledger.unpin(dependency);
        }
    }

    fn position(&self, id: &OperationId) -> Option<usize> {
        self.pending.iter().position(|operation| operation.id == *id)
    }

    fn snapshot(&self) -> QueueSnapshot {
        let slot = match &self.slot {
            Slot::Idle => SlotState::Idle,
            Slot::InFlight { id, attempt, transport, .. } => SlotState::InFlight {
                id: id.clone(),
                attempt: *attempt,
                transport: *transport,
            },
            Slot::Backoff { id, .. } => SlotState::Backoff {
                id: id.clone(),
                retry_count: self
                    .position(id)
                    .map(|index| self.pending[index].retry_count)
                    .unwrap_or_default(),
            },
        };
        QueueSnapshot {
            pending: self.pending.iter().map(SyncOperation::info).collect(),
            slot,
            metrics: self.metrics.clone(),
            online: self.context.monitor.is_online(),
        }
    }
}

/// 按状态码分类响应
fn classify_response(status_code: u16, body: Value) -> AttemptOutcome {
    match FailureKind::from_status(status_code) {
        None => AttemptOutcome::Success(body),
        Some(kind) => {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("服务端返回 {}", status_code));
            let body = if body.is_null() { None } else { Some(body) };
            AttemptOutcome::Failure(FailureDescriptor::new(kind, message).with_status(status_code, body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::config::ConnectivityConfig;
    use crate::connection_state::ConnectionState;
    use crate::network::test_helpers::MockPlatformConnectivity;
    use crate::network::NetworkStatus;
    use crate::sync::operation::Payload;
    use crate::sync::request_mapper::RestRequestMapper;
    use crate::test_support::{
        init_tracing, ChannelFrameSender, OutcomeRecorder, ScriptedDirectTransport, ScriptedReply,
    };
    use crate::transport::{InboundFrame, OutboundFrame, ResponseFrame};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    fn connectivity() -> ConnectivityConfig {
        ConnectivityConfig {
            settle_delay_ms: 0,
            transport_failure_hold_ms: 10,
            initial_online: true,
        }
    }

    fn retry(max_retries: u32, base_ms: u64) -> RetryConfig {
        RetryConfig {
            max_retries,
            backoff: BackoffPolicy::new(base_ms, base_ms * 100).with_jitter(0.0),
        }
    }

    fn context(
        retry: RetryConfig,
        monitor: ConnectivityMonitor,
        direct: Arc<ScriptedDirectTransport>,
        correlator: Option<RequestCorrelator>,
    ) -> QueueContext {
        QueueContext {
            retry,
            queue: QueueConfig::default(),
            monitor,
            correlator,
            direct,
            mapper: Arc::new(RestRequestMapper::new("http://api.test", HashMap::new())),
            events: EventManager::new(256),
        }
    }

    fn direct_queue(max_retries: u32) -> (SyncQueue, Arc<ScriptedDirectTransport>, EventManager) {
        init_tracing();
        let direct = ScriptedDirectTransport::new();
        let ctx = context(
            retry(max_retries, 100),
            ConnectivityMonitor::new(connectivity()),
            direct.clone(),
            None,
        );
        let events = ctx.events.clone();
        let (queue, _task) = SyncQueue::spawn(ctx);
        (queue, direct, events)
    }

    fn idempotency_keys(direct: &ScriptedDirectTransport) -> Vec<String> {
        direct
            .requests()
            .iter()
            .filter_map(|request| request.header("Idempotency-Key").map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_operations_dispatch_in_enqueue_order() {
        let (queue, direct, _events) = direct_queue(3);
        direct.set_latency(Duration::from_millis(50));
        let mut recorder = OutcomeRecorder::new();

        let ids = ["op-1", "op-2", "op-3", "op-4", "op-5"];
        for id in ids {
            queue
                .enqueue(recorder.track(OperationRequest::create("conversations", json!({"n": id})).with_id(id)))
                .await
                .unwrap();
        }

        let mut completed = Vec::new();
        for _ in ids {
            let (id, result) = recorder.next().await.unwrap();
            assert!(result.is_ok());
            completed.push(id.to_string());
        }
        assert_eq!(completed, ids);
        assert_eq!(idempotency_keys(&direct), ids);
        assert_eq!(direct.max_in_flight(), 1);
        assert!(queue.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_waits_and_reads_result() {
        let (queue, direct, _events) = direct_queue(5);
        direct.push(ScriptedReply::Status(503, Value::Null));
        direct.push(ScriptedReply::Status(503, Value::Null));
        direct.push(ScriptedReply::Status(201, json!({"id": "srv-42"})));
        let mut recorder = OutcomeRecorder::new();

        queue
            .enqueue(recorder.track(OperationRequest::create("conversations", json!({"title": "t"})).with_id("create")))
            .await
            .unwrap();
        let send = OperationRequest::create(
            "messages",
            Payload::deferred(|deps| {
                let id = deps
                    .get(&OperationId::from("create"))
                    .and_then(|result| result.get("id"))
                    .cloned()
                    .ok_or_else(|| PrivchatSyncError::NotFound("server id".to_string()))?;
                Ok(json!({"conversation_id": id, "text": "hi"}))
            }),
        )
        .with_id("send")
        .depends_on("create");
        queue.enqueue(recorder.track(send)).await.unwrap();

        let (first, result) = recorder.next().await.unwrap();
        assert_eq!(first.as_str(), "create");
        assert_eq!(result.unwrap(), json!({"id": "srv-42"}));
        let (second, result) = recorder.next().await.unwrap();
        assert_eq!(second.as_str(), "send");
        assert!(result.is_ok());

        let requests = direct.requests();
        assert_eq!(
            idempotency_keys(&direct),
            vec!["create", "create", "create", "send"]
        );
        assert_eq!(requests[3].body, Some(json!({"conversation_id": "srv-42", "text": "hi"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_cascades_transitively() {
        let (queue, direct, _events) = direct_queue(3);
        direct.push(ScriptedReply::Status(422, json!({"message": "title too long"})));
        let mut recorder = OutcomeRecorder::new();

        // a 失败 → b（依赖 a）→ c（依赖 b）；d 独立
        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("a"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::update("conversations/a", Value::Null).with_id("b").depends_on("a"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::create("messages", Value::Null).with_id("c").depends_on("b"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::create("messages", Value::Null).with_id("d"))).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(recorder.next().await.unwrap());
        }
        let order: Vec<&str> = outcomes.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a", "d"]);

        let failure = |index: usize| outcomes[index].1.clone().unwrap_err();
        assert_eq!(failure(0).kind, FailureKind::DependencyFailed);
        assert_eq!(failure(0).caused_by, Some(OperationId::from("a")));
        assert_eq!(failure(1).kind, FailureKind::DependencyFailed);
        assert_eq!(failure(2).kind, FailureKind::ServerRejected);
        assert_eq!(failure(2).status_code, Some(422));
        assert_eq!(failure(2).message, "title too long");
        assert!(outcomes[3].1.is_ok());

        // b、c 从未发送
        assert_eq!(idempotency_keys(&direct), vec!["a", "d"]);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(recorder.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_and_non_decreasing_delays() {
        init_tracing();
        let direct = ScriptedDirectTransport::new();
        for _ in 0..10 {
            direct.push(ScriptedReply::Status(503, Value::Null));
        }
        let retry = RetryConfig {
            max_retries: 4,
            backoff: BackoffPolicy::new(100, 1_000).with_jitter(0.5),
        };
        let (queue, _task) = SyncQueue::spawn(context(retry, ConnectivityMonitor::new(connectivity()), direct.clone(), None));
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::update("conversations/c-1", json!({})))).await.unwrap();
        let (_, result) = recorder.next().await.unwrap();
        let failure = result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::RetryExhausted);
        assert_eq!(failure.attempts, 5);
        assert_eq!(failure.status_code, Some(503));

        let times = direct.request_times();
        assert_eq!(times.len(), 5);
        let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0], "delays decreased: {:?}", gaps);
        }
        assert!(gaps[0] >= Duration::from_millis(100));
        assert!(gaps.iter().all(|gap| *gap <= Duration::from_millis(1_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let (queue, direct, events) = direct_queue(5);
        let mut sync_events = events.subscribe();
        for _ in 0..3 {
            direct.push(ScriptedReply::Status(503, json!({"message": "unavailable"})));
        }
        let mut recorder = OutcomeRecorder::new();

        let id = queue
            .enqueue(recorder.track(OperationRequest::update("conversations/c-1", json!({"title": "x"}))))
            .await
            .unwrap();
        let (done, result) = recorder.next().await.unwrap();
        assert_eq!(done, id);
        assert!(result.is_ok());
        assert_eq!(direct.request_count(), 4);

        let mut retries = Vec::new();
        let mut completed_attempts = None;
        while let Ok(event) = sync_events.try_recv() {
            match event {
                SyncEvent::OperationRetrying { attempt, failure, .. } => {
                    assert_eq!(failure.kind, FailureKind::ServerTransient);
                    retries.push(attempt);
                }
                SyncEvent::OperationCompleted { attempts, .. } => completed_attempts = Some(attempts),
                SyncEvent::OperationFailed { .. } => panic!("on_error must not fire"),
                _ => {}
            }
        }
        // 重试计数最终为 3
        assert_eq!(retries, vec![1, 2, 3]);
        assert_eq!(completed_attempts, Some(4));
        assert!(recorder.try_next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_operation_acked_over_channel() {
        init_tracing();
        let direct = ScriptedDirectTransport::new();
        let (sender, mut frames) = ChannelFrameSender::new(ConnectionState::Open);
        let correlator = RequestCorrelator::new(sender, Duration::from_secs(20));
        let (queue, _task) = SyncQueue::spawn(context(
            retry(3, 100),
            ConnectivityMonitor::new(connectivity()),
            direct.clone(),
            Some(correlator.clone()),
        ));
        let mut recorder = OutcomeRecorder::new();

        let id = queue
            .enqueue(recorder.track(OperationRequest::create("conversations", json!({"title": "t"})).persistent()))
            .await
            .unwrap();

        let frame: OutboundFrame = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(frame.request_id, id.as_str());
        assert_eq!(frame.operation, "create");
        assert_eq!(frame.payload, json!({"target": "conversations", "body": {"title": "t"}}));

        let snapshot = queue.snapshot().await.unwrap();
        assert!(matches!(snapshot.slot, SlotState::InFlight { transport: TransportHint::Persistent, .. }));

        let unmatched = correlator.handle_inbound(InboundFrame::Response(ResponseFrame {
            correlation_id: frame.correlation_id,
            status_code: 200,
            body: json!({"id": "srv-1", "title": "t"}),
        }));
        assert!(unmatched.is_none());

        let (done, result) = recorder.next().await.unwrap();
        assert_eq!(done, id);
        assert_eq!(result.unwrap(), json!({"id": "srv-1", "title": "t"}));
        assert!(queue.snapshot().await.unwrap().is_empty());
        assert_eq!(direct.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_mid_flight_becomes_retry() {
        init_tracing();
        let direct = ScriptedDirectTransport::new();
        let (sender, mut frames) = ChannelFrameSender::new(ConnectionState::Open);
        let correlator = RequestCorrelator::new(sender.clone(), Duration::from_secs(20));
        let ctx = context(retry(3, 100), ConnectivityMonitor::new(connectivity()), direct.clone(), Some(correlator.clone()));
        let mut sync_events = ctx.events.subscribe();
        let (queue, _task) = SyncQueue::spawn(ctx);
        let mut recorder = OutcomeRecorder::new();

        queue
            .enqueue(recorder.track(OperationRequest::update("conversations/c-1", json!({"title": "x"})).persistent()))
            .await
            .unwrap();
        frames.recv().await.unwrap();

        // 连接断开
        sender.set_state(ConnectionState::Closed);
        assert_eq!(correlator.fail_all("peer closed"), 1);

        // 重试时连接不可用，改走直连
        let (_, result) = recorder.next().await.unwrap();
        assert!(result.is_ok());
        assert_eq!(direct.request_count(), 1);

        let mut saw_retry = false;
        while let Ok(event) = sync_events.try_recv() {
            match event {
                SyncEvent::OperationRetrying { failure, .. } => {
                    assert_eq!(failure.kind, FailureKind::TransientNetwork);
                    saw_retry = true;
                }
                SyncEvent::OperationFailed { .. } => panic!("connection loss must not be terminal"),
                _ => {}
            }
        }
        assert!(saw_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_fails_before_dependency_callback() {
        let (queue, direct, _events) = direct_queue(3);
        direct.push(ScriptedReply::Status(400, json!({"message": "bad request"})));
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("e"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::create("messages", Value::Null).with_id("d").depends_on("e"))).await.unwrap();

        let (first, first_result) = recorder.next().await.unwrap();
        let (second, second_result) = recorder.next().await.unwrap();
        assert_eq!(first.as_str(), "d");
        assert_eq!(first_result.unwrap_err().kind, FailureKind::DependencyFailed);
        assert_eq!(second.as_str(), "e");
        assert_eq!(second_result.unwrap_err().kind, FailureKind::ServerRejected);
        assert_eq!(direct.request_count(), 1);

        // 依赖已失败的操作不能再入队
        let result = queue.enqueue(OperationRequest::create("messages", Value::Null).depends_on("e")).await;
        assert!(matches!(result, Err(PrivchatSyncError::InvalidOperation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_operations_wait_without_failing() {
        init_tracing();
        let platform = Arc::new(MockPlatformConnectivity::new(NetworkStatus::Offline));
        let monitor = ConnectivityMonitor::with_platform(connectivity(), platform.clone());
        monitor.start().await.unwrap();
        let direct = ScriptedDirectTransport::new();
        let (queue, _task) = SyncQueue::spawn(context(retry(3, 100), monitor, direct.clone(), None));
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("x"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("y"))).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(direct.request_count(), 0);
        assert!(recorder.try_next().is_none());
        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.online);
        assert_eq!(snapshot.slot, SlotState::Idle);

        platform.set_status(NetworkStatus::Online);
        let (first, _) = recorder.next().await.unwrap();
        let (second, _) = recorder.next().await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("x", "y"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependency_result_outlives_history_limit() {
        init_tracing();
        let platform = Arc::new(MockPlatformConnectivity::new(NetworkStatus::Offline));
        let monitor = ConnectivityMonitor::with_platform(connectivity(), platform.clone());
        monitor.start().await.unwrap();
        let direct = ScriptedDirectTransport::new();
        direct.push(ScriptedReply::Status(201, json!({"id": "srv-root"})));
        let mut ctx = context(retry(3, 100), monitor, direct.clone(), None);
        ctx.queue = QueueConfig { terminal_history_limit: 2 };
        let (queue, _task) = SyncQueue::spawn(ctx);
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("root"))).await.unwrap();
        for n in 0..6 {
            queue
                .enqueue(recorder.track(OperationRequest::create("contacts", json!({"n": n})).with_id(format!("filler-{}", n))))
                .await
                .unwrap();
        }
        let child = OperationRequest::create(
            "messages",
            Payload::deferred(|deps| {
                let id = deps
                    .get(&OperationId::from("root"))
                    .and_then(|result| result.get("id"))
                    .cloned()
                    .ok_or_else(|| PrivchatSyncError::NotFound("root result".to_string()))?;
                Ok(json!({"conversation_id": id}))
            }),
        )
        .with_id("child")
        .depends_on("root");
        queue.enqueue(recorder.track(child)).await.unwrap();

        platform.set_status(NetworkStatus::Online);
        let mut child_result = None;
        for _ in 0..8 {
            let (id, result) = recorder.next().await.unwrap();
            if id.as_str() == "child" {
                child_result = Some(result);
            } else {
                assert!(result.is_ok());
            }
        }
        assert!(child_result.unwrap().is_ok());
        let requests = direct.requests();
        assert_eq!(requests.len(), 8);
        assert_eq!(requests[7].body, Some(json!({"conversation_id": "srv-root"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_goes_offline_then_retries() {
        init_tracing();
        let monitor = ConnectivityMonitor::new(connectivity());
        let mut online_events = monitor.subscribe();
        let direct = ScriptedDirectTransport::new();
        direct.push(ScriptedReply::NetworkError);
        let ctx = context(retry(3, 100), monitor.clone(), direct.clone(), None);
        let mut sync_events = ctx.events.subscribe();
        let (queue, _task) = SyncQueue::spawn(ctx);
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("net"))).await.unwrap();

        let event = online_events.recv().await.unwrap();
        assert!(!event.online);
        assert!(!monitor.is_online());

        let (_, result) = recorder.next().await.unwrap();
        assert!(result.is_ok());
        assert_eq!(direct.request_count(), 2);
        // 离线保持期结束后才重试
        let times = direct.request_times();
        assert!(times[1] - times[0] >= Duration::from_millis(10));
        assert!(monitor.is_online());

        let mut saw_retry = false;
        while let Ok(event) = sync_events.try_recv() {
            match event {
                SyncEvent::OperationRetrying { failure, .. } => {
                    assert_eq!(failure.kind, FailureKind::TransientNetwork);
                    saw_retry = true;
                }
                SyncEvent::OperationFailed { .. } => panic!("network error must not be terminal"),
                _ => {}
            }
        }
        assert!(saw_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_rejects_malformed_input() {
        let (queue, _direct, _events) = direct_queue(3);

        let result = queue.enqueue(OperationRequest::create("", Value::Null)).await;
        assert!(matches!(result, Err(PrivchatSyncError::InvalidArgument(_))));

        let result = queue
            .enqueue(OperationRequest::create("conversations", Value::Null).with_id("self").depends_on("self"))
            .await;
        assert!(matches!(result, Err(PrivchatSyncError::InvalidArgument(_))));

        let result = queue.enqueue(OperationRequest::create("messages", Value::Null).depends_on("ghost")).await;
        assert!(matches!(result, Err(PrivchatSyncError::NotFound(_))));

        let mut recorder = OutcomeRecorder::new();
        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("dup"))).await.unwrap();
        let result = queue.enqueue(OperationRequest::create("conversations", Value::Null).with_id("dup")).await;
        assert!(matches!(result, Err(PrivchatSyncError::AlreadyExists(_))));

        // 依赖已完成的操作可以入队
        recorder.next().await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::update("conversations/dup", Value::Null).depends_on("dup"))).await.unwrap();
        assert!(recorder.next().await.unwrap().1.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_cascades_and_in_flight_is_refused() {
        let (queue, direct, _events) = direct_queue(3);
        direct.push(ScriptedReply::Hang);
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("busy"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("queued"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::create("messages", Value::Null).with_id("child").depends_on("queued"))).await.unwrap();

        let result = queue.cancel(&OperationId::from("busy")).await;
        assert!(matches!(result, Err(PrivchatSyncError::InvalidOperation(_))));
        let result = queue.cancel(&OperationId::from("missing")).await;
        assert!(matches!(result, Err(PrivchatSyncError::NotFound(_))));

        queue.cancel(&OperationId::from("queued")).await.unwrap();
        let (first, first_result) = recorder.next().await.unwrap();
        let (second, second_result) = recorder.next().await.unwrap();
        assert_eq!(first.as_str(), "child");
        let cascaded = first_result.unwrap_err();
        assert_eq!(cascaded.kind, FailureKind::Cancelled);
        assert_eq!(cascaded.caused_by, Some(OperationId::from("queued")));
        assert_eq!(second.as_str(), "queued");
        assert_eq!(second_result.unwrap_err().kind, FailureKind::Cancelled);

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.head().map(|op| op.id.as_str()), Some("busy"));
        assert_eq!(snapshot.metrics.cancelled, 2);
        assert_eq!(snapshot.metrics.cascaded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let (queue, direct, _events) = direct_queue(5);
        direct.push(ScriptedReply::Status(503, Value::Null));
        let mut recorder = OutcomeRecorder::new();

        let id = queue.enqueue(recorder.track(OperationRequest::delete("messages/m-1"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(queue.snapshot().await.unwrap().slot, SlotState::Backoff { retry_count: 1, .. }));

        queue.cancel(&id).await.unwrap();
        let (_, result) = recorder.next().await.unwrap();
        assert_eq!(result.unwrap_err().kind, FailureKind::Cancelled);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(direct.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_payload_error_is_terminal() {
        let (queue, direct, _events) = direct_queue(3);
        let mut recorder = OutcomeRecorder::new();

        let broken = OperationRequest::create(
            "messages",
            Payload::deferred(|_| Err(PrivchatSyncError::InvalidArgument("no server id".to_string()))),
        )
        .with_id("broken");
        queue.enqueue(recorder.track(broken)).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::update("messages/x", Value::Null).with_id("after").depends_on("broken"))).await.unwrap();

        let (first, first_result) = recorder.next().await.unwrap();
        let (second, second_result) = recorder.next().await.unwrap();
        assert_eq!(first.as_str(), "after");
        assert_eq!(first_result.unwrap_err().kind, FailureKind::DependencyFailed);
        assert_eq!(second.as_str(), "broken");
        assert_eq!(second_result.unwrap_err().kind, FailureKind::InvalidPayload);
        assert_eq!(direct.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_restored_expedites_persistent_retry() {
        init_tracing();
        let direct = ScriptedDirectTransport::new();
        let (sender, mut frames) = ChannelFrameSender::new(ConnectionState::Open);
        let correlator = RequestCorrelator::new(sender, Duration::from_secs(20));
        let (queue, _task) = SyncQueue::spawn(context(
            retry(3, 10_000),
            ConnectivityMonitor::new(connectivity()),
            direct,
            Some(correlator.clone()),
        ));
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).persistent())).await.unwrap();
        let first: OutboundFrame = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        correlator.handle_inbound(InboundFrame::Response(ResponseFrame {
            correlation_id: first.correlation_id,
            status_code: 503,
            body: Value::Null,
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(queue.snapshot().await.unwrap().slot, SlotState::Backoff { .. }));

        let restored_at = Instant::now();
        queue.notify_connection_restored();
        let second: OutboundFrame = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert!(restored_at.elapsed() < Duration::from_secs(10));
        assert_eq!(second.request_id, first.request_id);
        correlator.handle_inbound(InboundFrame::Response(ResponseFrame {
            correlation_id: second.correlation_id,
            status_code: 200,
            body: json!({"id": "srv-1"}),
        }));
        assert!(recorder.next().await.unwrap().1.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (queue, direct, _events) = direct_queue(3);
        direct.push(ScriptedReply::Hang);
        let mut recorder = OutcomeRecorder::new();

        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("a"))).await.unwrap();
        queue.enqueue(recorder.track(OperationRequest::create("conversations", Value::Null).with_id("b"))).await.unwrap();
        queue.shutdown().await.unwrap();

        let mut cancelled = Vec::new();
        while let Some((id, result)) = recorder.try_next() {
            assert_eq!(result.unwrap_err().kind, FailureKind::Cancelled);
            cancelled.push(id.to_string());
        }
        assert_eq!(cancelled, vec!["a", "b"]);

        let result = queue.enqueue(OperationRequest::create("conversations", Value::Null)).await;
        assert!(matches!(result, Err(PrivchatSyncError::ShuttingDown(_))));
    }

    #[test]
    fn test_classify_response() {
        assert!(matches!(classify_response(201, json!({"id": 1})), AttemptOutcome::Success(_)));
        match classify_response(503, Value::Null) {
            AttemptOutcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::ServerTransient);
                assert!(failure.body.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        match classify_response(409, json!({"message": "conflict"})) {
            AttemptOutcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::ServerRejected);
                assert_eq!(failure.message, "conflict");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_ledger_eviction() {
        let mut ledger = TerminalLedger::new(2);
        ledger.record_success(OperationId::from("a"), json!(1));
        ledger.record_failure(OperationId::from("b"));
        ledger.record_success(OperationId::from("c"), json!(3));
        assert!(!ledger.has_succeeded(&OperationId::from("a")));
        assert!(ledger.has_failed(&OperationId::from("b")));
        assert_eq!(ledger.result(&OperationId::from("c")), Some(&json!(3)));
    }

    #[test]
    fn test_ledger_keeps_pinned_results() {
        let mut ledger = TerminalLedger::new(1);
        let root = OperationId::from("root");
        ledger.pin(&root);
        ledger.record_success(root.clone(), json!({"id": "srv-1"}));
        ledger.record_success(OperationId::from("x"), json!(1));
        ledger.record_success(OperationId::from("y"), json!(2));
        assert_eq!(ledger.result(&root), Some(&json!({"id": "srv-1"})));
        assert!(!ledger.has_succeeded(&OperationId::from("x")));

        ledger.unpin(&root);
        assert!(!ledger.has_succeeded(&root));
        assert!(ledger.has_succeeded(&OperationId::from("y")));
    }
}
