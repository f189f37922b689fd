//! Mock 适配器（用于测试，无需外部工具进程）
//!
//! 每次下发调用 responder(command, 第几次下发)，统计下发与 shutdown 次数；
//! 可配置启动失败与响应延迟，与 ProcessAdapter 同样执行单命令在途约束。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::{BusyGuard, DbAdapter};
use crate::core::AdapterError;
use crate::ops::{OperationKind, ValidatedCommand};

type Responder = dyn Fn(&ValidatedCommand, usize) -> Result<Value, AdapterError> + Send + Sync;

/// 调用统计，测试持有 Arc 在 Session 结束后检查
#[derive(Debug, Default)]
pub struct MockAdapterStats {
    pub dispatches: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub started: AtomicBool,
    pub dispatched_kinds: Mutex<Vec<OperationKind>>,
}

impl MockAdapterStats {
    pub fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        self.dispatched_kinds.lock().map(|k| k.clone()).unwrap_or_default()
    }
}

pub struct MockAdapter {
    responder: Box<Responder>,
    stats: Arc<MockAdapterStats>,
    start_error: Option<AdapterError>,
    latency: Duration,
    busy: AtomicBool,
    stopped: AtomicBool,
}

impl MockAdapter {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ValidatedCommand, usize) -> Result<Value, AdapterError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            stats: Arc::new(MockAdapterStats::default()),
            start_error: None,
            latency: Duration::ZERO,
            busy: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// 每次都返回同一结果
    pub fn always_ok(value: Value) -> Self {
        Self::new(move |_, _| Ok(value.clone()))
    }

    pub fn failing_start(mut self, err: AdapterError) -> Self {
        self.start_error = Some(err);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn stats(&self) -> Arc<MockAdapterStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl DbAdapter for MockAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        self.stats.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&self, command: &ValidatedCommand, timeout: Duration) -> Result<Value, AdapterError> {
        let _busy = BusyGuard::acquire(&self.busy).ok_or(AdapterError::Busy)?;
        let n = self.stats.dispatches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut kinds) = self.stats.dispatched_kinds.lock() {
            kinds.push(command.kind);
        }
        if !self.latency.is_zero() {
            if self.latency > timeout {
                tokio::time::sleep(timeout).await;
                return Err(AdapterError::Timeout(timeout.as_millis() as u64));
            }
            tokio::time::sleep(self.latency).await;
        }
        (self.responder)(command, n)
    }

    fn healthy(&self) -> bool {
        self.stats.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;

    fn list_tables() -> ValidatedCommand {
        ValidatedCommand {
            kind: OperationKind::ListTables,
            target_table: None,
            parameters: Map::new(),
            dedup_key: Some("LIST_TABLES".to_string()),
        }
    }

    #[tokio::test]
    async fn test_dropped_command_releases_busy() {
        let adapter = MockAdapter::always_ok(json!([])).with_latency(Duration::from_millis(200));
        adapter.start().await.unwrap();
        let cmd = list_tables();

        // 在途命令被丢弃（如会话取消）
        let dropped =
            tokio::time::timeout(Duration::from_millis(20), adapter.execute(&cmd, Duration::from_secs(1))).await;
        assert!(dropped.is_err());

        let result = adapter.execute(&cmd, Duration::from_secs(1)).await;
        assert_eq!(result, Ok(json!([])));
        assert_eq!(adapter.stats().dispatches(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_command_is_busy() {
        let adapter = MockAdapter::always_ok(json!([])).with_latency(Duration::from_millis(50));
        adapter.start().await.unwrap();
        let cmd = list_tables();

        let (first, second) = tokio::join!(
            adapter.execute(&cmd, Duration::from_secs(1)),
            adapter.execute(&cmd, Duration::from_secs(1))
        );
        assert_eq!(first, Ok(json!([])));
        assert_eq!(second, Err(AdapterError::Busy));
    }
}
