/// 离线写操作同步模块
///
/// 职责：
/// - 操作模型与依赖声明（operation）
/// - 串行发送、依赖门控、重试与级联失败（queue）
/// - 重试决策（retry_policy）
/// - 操作到直连/长连接请求的映射（request_mapper）

pub mod operation;
pub mod queue;
pub mod request_mapper;
pub mod retry_policy;

pub use operation::{
    CompleteCallback, DependencyResults, ErrorCallback, OperationId, OperationInfo, OperationKind,
    OperationRequest, Payload, PayloadProducer, SyncOperation, TransportHint,
};
pub use queue::{QueueContext, QueueMetrics, QueueSnapshot, SlotState, SyncQueue};
pub use request_mapper::{ChannelRequest, RequestMapper, RestRequestMapper};
pub use retry_policy::{RetryDecision, RetryManager};
