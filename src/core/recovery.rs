//! 错误恢复引擎
//!
//! 根据循环内故障与连续失败次数返回 RecoveryAction：单次故障转为纠正提示继续循环，
//! 进程不可用或连续失败则终止会话。

use crate::core::{AdapterError, ClassificationError, PlannerError, RecoveryAction, SessionError};

/// 连续失败达到此值即终止（第二次连续失败升级）
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 分类错误永远可恢复：作为纠正信号交给 Planner
    pub fn handle_classification(&self, err: &ClassificationError) -> RecoveryAction {
        match err {
            ClassificationError::UnsupportedOperation(kind) => RecoveryAction::RetryWithPrompt(
                format!(
                    "Operation '{kind}' is not supported. Use one of: LIST_TABLES, DESCRIBE_TABLE, \
                     SELECT, INSERT, UPDATE, DELETE, CREATE_TABLE, DROP_TABLE, CREATE_INDEX."
                ),
            ),
            ClassificationError::InvalidParameters(detail) => RecoveryAction::RetryWithPrompt(
                format!("The previous operation was rejected: {detail}. Fix the parameters and try again."),
            ),
        }
    }

    /// 执行层错误；consecutive 为包含本次在内的连续执行层失败次数
    pub fn handle_adapter(&self, err: &AdapterError, consecutive: u32) -> RecoveryAction {
        match err {
            AdapterError::SpawnFailed(msg) => {
                RecoveryAction::Abort(SessionError::AdapterUnavailable(msg.clone()))
            }
            AdapterError::RemoteError { code, message } => RecoveryAction::RetryWithPrompt(
                format!("The database reported an error [{code}]: {message}"),
            ),
            e if consecutive >= MAX_CONSECUTIVE_FAILURES => RecoveryAction::Abort(
                SessionError::AdapterUnavailable(format!(
                    "{consecutive} consecutive failures, last: {e}"
                )),
            ),
            AdapterError::Timeout(ms) => RecoveryAction::RetryWithPrompt(format!(
                "The database tool did not answer within {ms} ms. You may retry the operation."
            )),
            e => RecoveryAction::RetryWithPrompt(format!(
                "The database tool failed: {e}. You may retry the operation."
            )),
        }
    }

    /// Planner 失败；consecutive 为包含本次在内的连续失败次数
    pub fn handle_planner(&self, err: &PlannerError, consecutive: u32) -> RecoveryAction {
        if consecutive >= MAX_CONSECUTIVE_FAILURES {
            return RecoveryAction::Abort(SessionError::PlannerUnavailable(err.to_string()));
        }
        match err {
            PlannerError::MalformedOutput(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output was not valid JSON: {raw}. \
                 Reply with exactly one JSON object: \
                 {{\"operation\": \"...\", \"table\": \"...\", \"params\": {{...}}}} \
                 or {{\"final_answer\": \"...\"}}."
            )),
            e => RecoveryAction::RetryWithPrompt(format!("Planning failed: {e}. Please try again.")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_classification_never_aborts() {
        let engine = RecoveryEngine::new();
        let err = ClassificationError::InvalidParameters("SELECT requires columns".into());
        match engine.handle_classification(&err) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("SELECT requires columns")),
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_timeout_retried_once() {
        let engine = RecoveryEngine::new();
        let err = AdapterError::Timeout(500);
        assert!(matches!(engine.handle_adapter(&err, 1), RecoveryAction::RetryWithPrompt(_)));
        assert!(matches!(
            engine.handle_adapter(&err, 2),
            RecoveryAction::Abort(SessionError::AdapterUnavailable(_))
        ));
    }

    #[test]
    fn test_recovery_spawn_failed_aborts_immediately() {
        let engine = RecoveryEngine::new();
        let err = AdapterError::SpawnFailed("exited".into());
        assert!(matches!(
            engine.handle_adapter(&err, 1),
            RecoveryAction::Abort(SessionError::AdapterUnavailable(_))
        ));
    }

    #[test]
    fn test_recovery_remote_error_is_context() {
        let engine = RecoveryEngine::new();
        let err = AdapterError::RemoteError {
            code: "42P01".into(),
            message: "relation \"ordrs\" does not exist".into(),
        };
        match engine.handle_adapter(&err, 5) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("42P01")),
            other => panic!("Expected RetryWithPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_planner_second_failure_aborts() {
        let engine = RecoveryEngine::new();
        let err = PlannerError::MalformedOutput("{oops".into());
        assert!(matches!(engine.handle_planner(&err, 1), RecoveryAction::RetryWithPrompt(_)));
        assert!(matches!(
            engine.handle_planner(&err, 2),
            RecoveryAction::Abort(SessionError::PlannerUnavailable(_))
        ));
    }
}
