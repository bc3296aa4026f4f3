//! 同步操作模型
//!
//! [`OperationRequest`] 是调用方构造的入队请求，入队后变成队列内部持有的
//! [`SyncOperation`]。回调只会被调用一次：成功调用 `on_complete`，
//! 最终失败调用 `on_error`。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{FailureDescriptor, PrivchatSyncError, Result};
use crate::utils::now_millis;

/// 操作 ID（队列内唯一）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// 生成新的随机 ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// 长连接请求里使用的操作名
    pub fn channel_verb(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel_verb())
    }
}

/// 传输方式提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    /// 直连请求/响应
    #[default]
    Direct,
    /// 通过长连接发送（连接未建立时退回直连）
    Persistent,
}

/// 依赖操作的成功结果，按 `depends_on` 的顺序排列
#[derive(Debug, Clone, Default)]
pub struct DependencyResults {
    results: Vec<(OperationId, Value)>,
}

impl DependencyResults {
    pub(crate) fn new(results: Vec<(OperationId, Value)>) -> Self {
        Self { results }
    }

    pub fn get(&self, id: &OperationId) -> Option<&Value> {
        self.results
            .iter()
            .find(|(dependency, _)| dependency == id)
            .map(|(_, value)| value)
    }

    /// 第一个依赖的结果（只有一个依赖时最常用）
    pub fn first(&self) -> Option<&Value> {
        self.results.first().map(|(_, value)| value)
    }
}

/// 延迟载荷生成器，在发送时根据依赖结果生成载荷
pub type PayloadProducer = Arc<dyn Fn(&DependencyResults) -> Result<Value> + Send + Sync>;

/// 操作载荷
#[derive(Clone)]
pub enum Payload {
    /// 入队时已确定的值
    Value(Value),
    /// 发送时才生成（例如需要嵌入上游操作返回的服务端 ID）
    Deferred(PayloadProducer),
}

impl Payload {
    pub fn deferred<F>(producer: F) -> Self
    where
        F: Fn(&DependencyResults) -> Result<Value> + Send + Sync + 'static,
    {
        Payload::Deferred(Arc::new(producer))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Payload::Deferred(_))
    }

    /// 生成实际发送的载荷；每次尝试都会重新生成
    pub fn resolve(&self, dependencies: &DependencyResults) -> Result<Value> {
        match self {
            Payload::Value(value) => Ok(value.clone()),
            Payload::Deferred(producer) => producer(dependencies),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Payload::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

pub type CompleteCallback = Box<dyn FnOnce(OperationId, Value) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(OperationId, FailureDescriptor) + Send>;

/// 入队请求
pub struct OperationRequest {
    pub(crate) id: Option<OperationId>,
    pub(crate) kind: OperationKind,
    pub(crate) target: String,
    pub(crate) payload: Payload,
    pub(crate) depends_on: Vec<OperationId>,
    pub(crate) transport_hint: TransportHint,
    pub(crate) on_complete: Option<CompleteCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, target: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            id: None,
            kind,
            target: target.into(),
            payload: payload.into(),
            depends_on: Vec::new(),
            transport_hint: TransportHint::Direct,
            on_complete: None,
            on_error: None,
        }
    }

    pub fn create(target: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::new(OperationKind::Create, target, payload)
    }

    pub fn update(target: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::new(OperationKind::Update, target, payload)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, target, Value::Null)
    }

    /// 指定操作 ID（不指定则入队时生成）
    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// 追加一个依赖；重复的依赖会被忽略
    pub fn depends_on(mut self, id: impl Into<OperationId>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn depends_on_all<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OperationId>,
    {
        for id in ids {
            self = self.depends_on(id);
        }
        self
    }

    pub fn transport(mut self, hint: TransportHint) -> Self {
        self.transport_hint = hint;
        self
    }

    pub fn persistent(self) -> Self {
        self.transport(TransportHint::Persistent)
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(OperationId, Value) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(OperationId, FailureDescriptor) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for OperationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("payload", &self.payload)
            .field("depends_on", &self.depends_on)
            .field("transport_hint", &self.transport_hint)
            .finish()
    }
}

/// 队列中的同步操作
pub struct SyncOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub target: String,
    pub payload: Payload,
    pub depends_on: Vec<OperationId>,
    pub transport_hint: TransportHint,
    /// 已经安排过的重试次数
    pub retry_count: u32,
    /// 入队时间（UTC毫秒时间戳）
    pub created_at: u64,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl SyncOperation {
    /// 从入队请求构造，校验目标和自依赖
    pub(crate) fn from_request(request: OperationRequest) -> Result<Self> {
        let id = request.id.unwrap_or_default();
        if request.target.trim().is_empty() {
            return Err(PrivchatSyncError::InvalidArgument(format!("操作 {} 缺少 target", id)));
        }
        if request.depends_on.contains(&id) {
            return Err(PrivchatSyncError::InvalidArgument(format!("操作 {} 不能依赖自身", id)));
        }
        Ok(Self {
            id,
            kind: request.kind,
            target: request.target,
            payload: request.payload,
            depends_on: request.depends_on,
            transport_hint: request.transport_hint,
            retry_count: 0,
            created_at: now_millis(),
            on_complete: request.on_complete,
            on_error: request.on_error,
        })
    }

    /// 触发成功回调（只会生效一次）
    pub(crate) fn complete(&mut self, result: Value) {
        self.on_error = None;
        if let Some(callback) = self.on_complete.take() {
            callback(self.id.clone(), result);
        }
    }

    /// 触发失败回调（只会生效一次）
    pub(crate) fn fail(&mut self, failure: FailureDescriptor) {
        self.on_complete = None;
        if let Some(callback) = self.on_error.take() {
            callback(self.id.clone(), failure);
        }
    }

    pub fn info(&self) -> OperationInfo {
        OperationInfo {
            id: self.id.clone(),
            kind: self.kind,
            target: self.target.clone(),
            depends_on: self.depends_on.clone(),
            transport_hint: self.transport_hint,
            retry_count: self.retry_count,
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("depends_on", &self.depends_on)
            .field("transport_hint", &self.transport_hint)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// 操作的只读信息（用于快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub id: OperationId,
    pub kind: OperationKind,
    pub target: String,
    pub depends_on: Vec<OperationId>,
    pub transport_hint: TransportHint,
    pub retry_count: u32,
    pub created_at: u64,
}
