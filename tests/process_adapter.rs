//! ProcessAdapter 集成测试：用 `sh -c` 脚本模拟外部数据库工具
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use dbee::adapter::{DbAdapter, ProcessAdapter, ProcessAdapterConfig};
use dbee::core::{AdapterError, SessionError};
use dbee::ops::{
    classify, Classified, ExecutionTracker, IntendedOperation, Outcome, ValidatedCommand,
};
use dbee::react::{Planner, PlannerStep, ScriptedPlanner, Session, SessionStatus};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// 从请求行提取 id（请求 JSON 以 {"id":N 开头）
const READ_ID: &str = r#"id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\).*/\1/p')"#;

const TIMEOUT: Duration = Duration::from_secs(3);

fn responder(body: &str) -> String {
    format!("while IFS= read -r line; do {READ_ID}; {body}; done")
}

fn sh_config(script: &str) -> ProcessAdapterConfig {
    ProcessAdapterConfig::new("sh")
        .with_args(["-c", script])
        .with_startup_grace(Duration::from_millis(100))
        .with_shutdown_grace(Duration::from_secs(2))
}

fn sh(script: &str) -> ProcessAdapter {
    ProcessAdapter::new(sh_config(script))
}

fn command(op: IntendedOperation) -> ValidatedCommand {
    match classify(op, &ExecutionTracker::new()).unwrap() {
        Classified::Dispatch(cmd) => cmd,
        other => panic!("expected dispatch, got {:?}", other),
    }
}

fn list_tables() -> ValidatedCommand {
    command(IntendedOperation::new("LIST_TABLES"))
}

#[tokio::test]
async fn test_execute_returns_tool_data() {
    let adapter = sh(&responder(
        r#"printf '{"id":%s,"status":"ok","data":["customers","orders"]}\n' "$id""#,
    ));
    adapter.start().await.unwrap();
    assert!(adapter.healthy());

    let data = adapter.execute(&list_tables(), TIMEOUT).await.unwrap();
    assert_eq!(data, json!(["customers", "orders"]));

    // 同一进程可连续处理多条命令
    let data = adapter.execute(&list_tables(), TIMEOUT).await.unwrap();
    assert_eq!(data, json!(["customers", "orders"]));

    adapter.shutdown().await;
    assert!(!adapter.healthy());
    assert_eq!(adapter.kill_attempts(), 0);
}

#[tokio::test]
async fn test_request_carries_operation_and_table() {
    // 原样回显请求行，检查线上格式
    let adapter = sh(&responder(
        r#"printf '{"id":%s,"status":"ok","data":%s}\n' "$id" "$line""#,
    ));
    adapter.start().await.unwrap();

    let cmd = command(
        IntendedOperation::new("SELECT")
            .on_table("orders")
            .with_param("filter", json!({"status": "delayed"})),
    );
    let echoed = adapter.execute(&cmd, TIMEOUT).await.unwrap();
    assert_eq!(echoed["operation"], "SELECT");
    assert_eq!(echoed["table"], "orders");
    assert_eq!(echoed["params"]["filter"]["status"], "delayed");

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_stale_response_after_timeout_is_discarded() {
    let script = format!(
        "n=0; while IFS= read -r line; do n=$((n+1)); {READ_ID}; \
         if [ \"$n\" -eq 1 ]; then sleep 1; printf '{{\"id\":%s,\"status\":\"ok\",\"data\":\"stale\"}}\\n' \"$id\"; \
         else printf '{{\"id\":%s,\"status\":\"ok\",\"data\":\"fresh\"}}\\n' \"$id\"; fi; done"
    );
    let adapter = sh(&script);
    adapter.start().await.unwrap();

    let first = adapter.execute(&list_tables(), Duration::from_millis(200)).await;
    assert_eq!(first, Err(AdapterError::Timeout(200)));

    let second = adapter.execute(&list_tables(), TIMEOUT).await.unwrap();
    assert_eq!(second, json!("fresh"));

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_remote_error_keeps_process_usable() {
    let script = format!(
        "n=0; while IFS= read -r line; do n=$((n+1)); {READ_ID}; \
         if [ \"$n\" -eq 1 ]; then printf '{{\"id\":%s,\"status\":\"error\",\"error_code\":\"42P01\",\"error_message\":\"no such table\"}}\\n' \"$id\"; \
         else printf '{{\"id\":%s,\"status\":\"ok\",\"data\":[]}}\\n' \"$id\"; fi; done"
    );
    let adapter = sh(&script);
    adapter.start().await.unwrap();

    let err = adapter.execute(&list_tables(), TIMEOUT).await.unwrap_err();
    assert_eq!(
        err,
        AdapterError::RemoteError {
            code: "42P01".to_string(),
            message: "no such table".to_string(),
        }
    );
    assert!(adapter.healthy());
    assert_eq!(adapter.execute(&list_tables(), TIMEOUT).await.unwrap(), json!([]));

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_malformed_response_is_protocol_violation() {
    let adapter = sh(&responder("echo 'not json'"));
    adapter.start().await.unwrap();

    let err = adapter.execute(&list_tables(), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AdapterError::ProtocolViolation(_)));

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_exit_mid_command_then_spawn_failed() {
    let adapter = sh("IFS= read -r line; exit 0");
    adapter.start().await.unwrap();

    let err = adapter.execute(&list_tables(), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AdapterError::ProtocolViolation(_)), "got {:?}", err);

    let err = adapter.execute(&list_tables(), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AdapterError::SpawnFailed(_)), "got {:?}", err);
    assert!(!adapter.healthy());

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_immediate_exit_is_spawn_failed() {
    let adapter = sh("exit 3");
    let err = adapter.start().await.unwrap_err();
    assert!(matches!(err, AdapterError::SpawnFailed(_)), "got {:?}", err);
    assert!(!adapter.healthy());
}

#[tokio::test]
async fn test_missing_binary_is_spawn_failed() {
    let adapter = ProcessAdapter::new(ProcessAdapterConfig::new("/nonexistent/dbtool-for-tests"));
    let err = adapter.start().await.unwrap_err();
    assert!(matches!(err, AdapterError::SpawnFailed(_)), "got {:?}", err);

    // 从未启动时 shutdown 也安全
    adapter.shutdown().await;
    assert_eq!(adapter.kill_attempts(), 0);
}

#[tokio::test]
async fn test_connection_string_passed_via_env() {
    let adapter = ProcessAdapter::new(
        sh_config(&responder(
            r#"printf '{"id":%s,"status":"ok","data":"%s"}\n' "$id" "$DATABASE_URL""#,
        ))
        .with_connection("postgres://app@localhost:5432/shop"),
    );
    adapter.start().await.unwrap();

    let data = adapter.execute(&list_tables(), TIMEOUT).await.unwrap();
    assert_eq!(data, json!("postgres://app@localhost:5432/shop"));

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_connection_string_passed_as_arg() {
    // sh -c SCRIPT NAME URL：URL 成为 $1
    let mut config = sh_config(&responder(
        r#"printf '{"id":%s,"status":"ok","data":"%s"}\n' "$id" "$1""#,
    ))
    .with_connection("postgres://app@localhost:5432/shop");
    config.args.push("dbtool".to_string());
    config.connection_env = None;
    config.connection_as_arg = true;
    let adapter = ProcessAdapter::new(config);
    adapter.start().await.unwrap();

    let data = adapter.execute(&list_tables(), TIMEOUT).await.unwrap();
    assert_eq!(data, json!("postgres://app@localhost:5432/shop"));

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_second_concurrent_command_is_busy() {
    let adapter = sh(&responder(
        r#"sleep 1; printf '{"id":%s,"status":"ok","data":"slow"}\n' "$id""#,
    ));
    adapter.start().await.unwrap();

    let cmd = list_tables();
    let (first, second) = tokio::join!(adapter.execute(&cmd, TIMEOUT), adapter.execute(&cmd, TIMEOUT));
    assert_eq!(first, Ok(json!("slow")));
    assert_eq!(second, Err(AdapterError::Busy));

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let adapter = sh(&responder(r#"printf '{"id":%s,"status":"ok"}\n' "$id""#));
    adapter.start().await.unwrap();

    adapter.shutdown().await;
    adapter.shutdown().await;
    assert_eq!(adapter.kill_attempts(), 0);
    assert!(!adapter.healthy());

    let err = adapter.execute(&list_tables(), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AdapterError::SpawnFailed(_)));
}

#[tokio::test]
async fn test_stubborn_tool_is_killed_once() {
    let adapter = ProcessAdapter::new(
        sh_config("trap '' TERM; while true; do sleep 1; done")
            .with_shutdown_grace(Duration::from_millis(300)),
    );
    adapter.start().await.unwrap();

    adapter.shutdown().await;
    assert_eq!(adapter.kill_attempts(), 1);
    adapter.shutdown().await;
    assert_eq!(adapter.kill_attempts(), 1);
}

#[tokio::test]
async fn test_timeout_during_request_write_retires_process() {
    // 工具从不读 stdin：超过管道缓冲的请求写到一半就会超时
    let adapter = ProcessAdapter::new(
        sh_config("sleep 30").with_shutdown_grace(Duration::from_millis(300)),
    );
    adapter.start().await.unwrap();

    let huge = command(
        IntendedOperation::new("SELECT")
            .on_table("orders")
            .with_param("filter", json!({ "note": "x".repeat(1024 * 1024) })),
    );
    let err = adapter.execute(&huge, Duration::from_millis(200)).await.unwrap_err();
    assert_eq!(err, AdapterError::Timeout(200));
    assert!(!adapter.healthy());

    let err = adapter.execute(&list_tables(), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, AdapterError::SpawnFailed(_)), "got {:?}", err);

    adapter.shutdown().await;
}

#[tokio::test]
async fn test_session_fails_when_tool_dies_mid_command() {
    let adapter = sh("IFS= read -r line; exit 0");
    let planner = Arc::new(ScriptedPlanner::new([
        PlannerStep::Operation(IntendedOperation::new("LIST_TABLES")),
        PlannerStep::Operation(IntendedOperation::new("LIST_TABLES")),
        PlannerStep::FinalAnswer("unreachable".to_string()),
    ]));
    let dyn_planner: Arc<dyn Planner> = planner.clone();

    let outcome = Session::new(Box::new(adapter), dyn_planner, CancellationToken::new())
        .run("what tables exist?")
        .await;

    assert!(
        matches!(outcome.error(), Some(SessionError::AdapterUnavailable(_))),
        "got {:?}",
        outcome
    );
    let records = outcome.records();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].outcome, Outcome::Error(_)));
    // 第二次规划后在下发前发现进程已退出
    assert_eq!(planner.calls(), 2);
}

#[tokio::test]
async fn test_session_over_real_process() {
    let adapter = sh(&responder(
        r#"printf '{"id":%s,"status":"ok","data":["orders"]}\n' "$id""#,
    ));
    let planner: Arc<dyn Planner> = Arc::new(ScriptedPlanner::new([
        PlannerStep::Operation(IntendedOperation::new("LIST_TABLES")),
        PlannerStep::Operation(IntendedOperation::new("LIST_TABLES")),
        PlannerStep::FinalAnswer("orders".to_string()),
    ]));

    let outcome = Session::new(Box::new(adapter), planner, CancellationToken::new())
        .run("what tables exist?")
        .await;

    assert_eq!(outcome.status(), SessionStatus::Done);
    assert_eq!(outcome.records().len(), 1);
}
