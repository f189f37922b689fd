//! 执行层：外部数据库工具的子进程协议适配器
//!
//! DbAdapter 为 Session 与外部工具之间的接缝：ProcessAdapter 驱动真实子进程，
//! MockAdapter 供测试按脚本返回结果。

pub mod mock;
pub mod process;
pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::AdapterError;
use crate::ops::ValidatedCommand;

pub use mock::{MockAdapter, MockAdapterStats};
pub use process::{ProcessAdapter, ProcessAdapterConfig};
pub use protocol::{ToolRequest, ToolResponse};

/// 外部数据库工具适配器：一次只允许一条命令在途
#[async_trait]
pub trait DbAdapter: Send + Sync {
    /// 启动工具进程；可执行文件缺失或立即退出时返回 SpawnFailed
    async fn start(&self) -> Result<(), AdapterError>;

    /// 下发一条命令并在 timeout 内等待结构化结果；不自动重试
    async fn execute(&self, command: &ValidatedCommand, timeout: Duration) -> Result<Value, AdapterError>;

    /// 非阻塞存活检查
    fn healthy(&self) -> bool;

    /// 终止进程；幂等，任何状态下调用都安全
    async fn shutdown(&self);
}

/// 在途标志的 RAII 守卫：离开作用域即释放（含 future 被丢弃）
pub(crate) struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
