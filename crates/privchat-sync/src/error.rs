use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sync::operation::OperationId;

/// 同步核心错误类型
#[derive(Debug, thiserror::Error)]
pub enum PrivchatSyncError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Not connected")]
    NotConnected,
    /// 传输层错误（没有收到任何响应）
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    /// 长连接在请求完成前断开
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
    /// 服务端返回的应用层错误
    #[error("RPC error [{status}]: {message}")]
    Rpc { status: u16, message: String },
}

impl From<serde_json::Error> for PrivchatSyncError {
    fn from(error: serde_json::Error) -> Self {
        PrivchatSyncError::Serialization(error.to_string())
    }
}

impl PrivchatSyncError {
    /// 是否是网络层错误（用于向连通性监控上报负面信号）
    pub fn is_network_level(&self) -> bool {
        matches!(
            self,
            PrivchatSyncError::Transport(_)
                | PrivchatSyncError::Timeout(_)
                | PrivchatSyncError::ConnectionLost(_)
                | PrivchatSyncError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, PrivchatSyncError>;

/// 失败分类
///
/// `TransientNetwork` 和 `ServerTransient` 只在重试循环内部出现，
/// 其余类型都会通过 `on_error` 恰好上报一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// 无响应、连接断开、超时
    TransientNetwork,
    /// 服务端暂时不可用（503 等）
    ServerTransient,
    /// 服务端明确拒绝（校验失败、永久性应用错误）
    ServerRejected,
    /// 超过最大重试次数
    RetryExhausted,
    /// 调用方撤回，或依赖被撤回
    Cancelled,
    /// 依赖的操作最终失败
    DependencyFailed,
    /// 延迟载荷无法生成
    InvalidPayload,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::TransientNetwork | FailureKind::ServerTransient)
    }

    /// 根据 HTTP 风格的状态码分类失败；2xx 返回 None
    pub fn from_status(status: u16) -> Option<FailureKind> {
        match status {
            200..=299 => None,
            408 | 425 | 429 => Some(FailureKind::ServerTransient),
            500..=599 => Some(FailureKind::ServerTransient),
            _ => Some(FailureKind::ServerRejected),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::ServerTransient => "server_transient",
            FailureKind::ServerRejected => "server_rejected",
            FailureKind::RetryExhausted => "retry_exhausted",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DependencyFailed => "dependency_failed",
            FailureKind::InvalidPayload => "invalid_payload",
        };
        f.write_str(name)
    }
}

/// 交给 `on_error` 的失败详情
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDescriptor {
    pub kind: FailureKind,
    pub message: String,
    /// 服务端状态码（如果收到过响应）
    pub status_code: Option<u16>,
    /// 服务端响应体（如果有）
    pub body: Option<serde_json::Value>,
    /// 级联失败时，导致失败的上游操作
    pub caused_by: Option<OperationId>,
    /// 已经尝试的次数
    pub attempts: u32,
}

impl FailureDescriptor {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            body: None,
            caused_by: None,
            attempts: 0,
        }
    }

    pub fn with_status(mut self, status: u16, body: Option<serde_json::Value>) -> Self {
        self.status_code = Some(status);
        self.body = body;
        self
    }

    pub fn with_cause(mut self, cause: OperationId) -> Self {
        self.caused_by = Some(cause);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for FailureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{} [{}]: {}", self.kind, status, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// 从错误转换为失败分类
impl From<&PrivchatSyncError> for FailureKind {
    fn from(error: &PrivchatSyncError) -> Self {
        match error {
            PrivchatSyncError::Transport(_)
            | PrivchatSyncError::Timeout(_)
            | PrivchatSyncError::ConnectionLost(_)
            | PrivchatSyncError::NotConnected => FailureKind::TransientNetwork,
            PrivchatSyncError::Rpc { status, .. } => {
                FailureKind::from_status(*status).unwrap_or(FailureKind::ServerRejected)
            }
            PrivchatSyncError::ShuttingDown(_) => FailureKind::Cancelled,
            _ => FailureKind::ServerRejected,
        }
    }
}

impl From<PrivchatSyncError> for FailureDescriptor {
    fn from(error: PrivchatSyncError) -> Self {
        let kind = FailureKind::from(&error);
        let status = match &error {
            PrivchatSyncError::Rpc { status, .. } => Some(*status),
            _ => None,
        };
        FailureDescriptor {
            kind,
            message: error.to_string(),
            status_code: status,
            body: None,
            caused_by: None,
            attempts: 0,
        }
    }
}
