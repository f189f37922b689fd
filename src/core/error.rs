//! 错误类型与恢复动作
//!
//! 三层错误：ClassificationError（输入问题，循环内可恢复）、AdapterError（执行层）、
//! SessionError（终止会话）。与 RecoveryEngine 配合决定 RetryWithPrompt / Abort。

use thiserror::Error;

/// 分类阶段错误：反馈给 Planner 作为纠正信号，不终止会话
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// 外部数据库工具进程的执行层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Tool process unavailable: {0}")]
    SpawnFailed(String),

    #[error("Tool did not respond within {0} ms")]
    Timeout(u64),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// 工具自身报告的结构化错误（如 SQL 错误），属正常结果而非缺陷
    #[error("Remote error [{code}]: {message}")]
    RemoteError { code: String, message: String },

    #[error("Another command is already in flight")]
    Busy,
}

impl AdapterError {
    /// 单次可重试的执行层故障（连续第二次则升级为 AdapterUnavailable）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout(_) | AdapterError::ProtocolViolation(_) | AdapterError::Busy
        )
    }
}

/// Planner 调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlannerError {
    #[error("Planner did not answer within {0} s")]
    Timeout(u64),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Malformed planner output: {0}")]
    MalformedOutput(String),
}

/// 终止性会话错误：随部分 ExecutionRecord 一并返回调用方
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Max iterations exceeded ({0})")]
    MaxIterationsExceeded(usize),

    #[error("Cancelled")]
    Cancelled,

    #[error("Database tool unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Planner unavailable: {0}")]
    PlannerUnavailable(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示写入上下文，下一轮由 Planner 自行修正
    RetryWithPrompt(String),
    /// 终止会话
    Abort(SessionError),
}
