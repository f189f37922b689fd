//! dbee - 自然语言数据库助手
//!
//! 入口：加载 .env 与配置、初始化日志、创建编排器，逐行读取用户问题并打印回答。
//! 输入 exit 或 Ctrl+C 退出；Ctrl+C 会打断在途会话并关闭其工具进程。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dbee::config::{load_config, AppConfig};
use dbee::core::{Orchestrator, SessionSupervisor, ShutdownManager};
use dbee::ops::Outcome;
use dbee::SessionOutcome;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    dbee::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let supervisor = SessionSupervisor::with_token(shutdown.token());
    let orchestrator =
        Orchestrator::from_config(&cfg, supervisor).context("Failed to create orchestrator")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nAsk your database (or 'exit' to quit): ");
        std::io::stdout().flush().ok();

        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query.eq_ignore_ascii_case("exit") {
            break;
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let event_log = tokio::spawn(async move {
            while let Some(ev) = event_rx.recv().await {
                if let Ok(json) = serde_json::to_string(&ev) {
                    tracing::debug!(event = %json, "session event");
                }
            }
        });
        let outcome = orchestrator.answer_with_events(query, Some(event_tx)).await;
        let _ = event_log.await;

        print_outcome(&outcome);
        if shutdown.is_shutdown() {
            break;
        }
    }

    tracing::info!("Exiting gracefully");
    Ok(())
}

fn print_outcome(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Done { answer, .. } => println!("\n{}", answer),
        SessionOutcome::Failed { error, records } => {
            println!("\nQuery failed: {}", error);
            for r in records {
                let result = match &r.outcome {
                    Outcome::Success => "ok".to_string(),
                    Outcome::Error(e) => format!("error: {}", e),
                };
                println!(
                    "  #{} {} {} -> {}",
                    r.sequence_number,
                    r.kind,
                    r.target_table.as_deref().unwrap_or("-"),
                    result
                );
            }
        }
    }
}
