//! 子进程协议适配器
//!
//! 每个 Session 持有一个长驻外部数据库工具进程：stdin 写入一行请求，stdout 读取一行响应。
//! - 同一时刻只允许一条命令在途，并发调用立即返回 Busy（不排队）
//! - 超时不自动重试；带 id 的过期响应（来自已超时的请求）在读取时丢弃；
//!   请求行未写完就超时则视为流已失步，进程不再可用
//! - 进程在命令在途时退出：本次为 ProtocolViolation，之后均为 SpawnFailed
//! - kill_on_drop 保证任何退出路径（含 future 被丢弃）都会回收进程

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::adapter::protocol::{ToolRequest, ToolResponse, MAX_RESPONSE_BYTES};
use crate::adapter::{BusyGuard, DbAdapter};
use crate::config::ToolSection;
use crate::core::AdapterError;
use crate::ops::ValidatedCommand;

/// 启动外部工具所需参数
#[derive(Debug, Clone)]
pub struct ProcessAdapterConfig {
    pub command: String,
    pub args: Vec<String>,
    /// 数据库连接串，仅在进程启动时提供一次
    pub connection_string: Option<String>,
    /// 以环境变量传入连接串（如 DATABASE_URL）
    pub connection_env: Option<String>,
    /// 同时把连接串追加为最后一个命令行参数
    pub connection_as_arg: bool,
    pub startup_grace: Duration,
    pub shutdown_grace: Duration,
    /// true 时工具的 stderr 直接继承到本进程，否则丢弃
    pub forward_stderr: bool,
}

impl ProcessAdapterConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            connection_string: None,
            connection_env: Some("DATABASE_URL".to_string()),
            connection_as_arg: false,
            startup_grace: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(2),
            forward_stderr: true,
        }
    }

    pub fn from_section(section: &ToolSection, connection_string: Option<String>) -> Self {
        Self {
            command: section.command.clone(),
            args: section.args.clone(),
            connection_string,
            connection_env: section.connection_env.clone(),
            connection_as_arg: section.connection_as_arg,
            startup_grace: Duration::from_millis(section.startup_grace_ms),
            shutdown_grace: Duration::from_millis(section.shutdown_grace_ms),
            forward_stderr: section.forward_stderr,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connection(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

struct ToolIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// 跨调用保留的未完成行（read_until 被超时打断时已读字节留在这里）
    pending: Vec<u8>,
    /// 请求行尚未完整写入；此时被超时打断，管道里会残留半行
    writing: bool,
}

/// 管理单个外部工具进程的适配器
pub struct ProcessAdapter {
    config: ProcessAdapterConfig,
    child: Mutex<Option<Child>>,
    io: tokio::sync::Mutex<Option<ToolIo>>,
    busy: AtomicBool,
    /// 进程已退出或流已失步，之后的调用一律 SpawnFailed
    dead: AtomicBool,
    next_id: AtomicU64,
    kill_attempts: AtomicU32,
}

impl ProcessAdapter {
    pub fn new(config: ProcessAdapterConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            io: tokio::sync::Mutex::new(None),
            busy: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            kill_attempts: AtomicU32::new(0),
        }
    }

    /// 强制 kill 的次数（shutdown 幂等：重复调用不会增加）
    pub fn kill_attempts(&self) -> u32 {
        self.kill_attempts.load(Ordering::Relaxed)
    }

    fn build_command(&self) -> Command {
        let cfg = &self.config;
        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args);
        if let Some(url) = &cfg.connection_string {
            if let Some(var) = &cfg.connection_env {
                cmd.env(var, url);
            }
            if cfg.connection_as_arg {
                cmd.arg(url);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if cfg.forward_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        cmd
    }

    fn mark_dead(&self, reason: &str) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
            let status = match guard.as_mut() {
                Some(c) => c.try_wait().ok().flatten(),
                None => None,
            };
            drop(guard);
            tracing::warn!(command = %self.config.command, ?status, "db tool unusable: {}", reason);
        }
    }

    /// 写一行请求并读取匹配 id 的响应行
    async fn exchange(&self, io: &mut ToolIo, line: &str, id: u64) -> Result<Value, AdapterError> {
        io.writing = true;
        let written = async {
            io.stdin.write_all(line.as_bytes()).await?;
            io.stdin.flush().await
        }
        .await;
        io.writing = false;
        if let Err(e) = written {
            self.mark_dead("stdin closed");
            return Err(AdapterError::ProtocolViolation(format!("write to tool failed: {e}")));
        }

        loop {
            let remaining = (MAX_RESPONSE_BYTES + 1).saturating_sub(io.pending.len()) as u64;
            let n = (&mut io.stdout)
                .take(remaining)
                .read_until(b'\n', &mut io.pending)
                .await
                .map_err(|e| AdapterError::ProtocolViolation(format!("read from tool failed: {e}")))?;

            if io.pending.len() > MAX_RESPONSE_BYTES {
                io.pending.clear();
                self.mark_dead("oversized response");
                return Err(AdapterError::ProtocolViolation(format!(
                    "response exceeds {MAX_RESPONSE_BYTES} bytes"
                )));
            }
            if n == 0 || io.pending.last() != Some(&b'\n') {
                io.pending.clear();
                self.mark_dead("stdout closed");
                return Err(AdapterError::ProtocolViolation(
                    "tool exited while a command was outstanding".to_string(),
                ));
            }

            let raw = std::mem::take(&mut io.pending);
            let text = String::from_utf8_lossy(&raw);
            if text.trim().is_empty() {
                continue;
            }
            let response = ToolResponse::parse(&text)?;
            if response.is_stale_for(id) {
                tracing::debug!(expected = id, got = ?response.id, "discarding stale tool response");
                continue;
            }
            return response.into_result();
        }
    }
}

#[async_trait]
impl DbAdapter for ProcessAdapter {
    async fn start(&self) -> Result<(), AdapterError> {
        if self.child.lock().map(|g| g.is_some()).unwrap_or(false) {
            return Ok(());
        }

        let mut child = self.build_command().spawn().map_err(|e| {
            AdapterError::SpawnFailed(format!("{}: {}", self.config.command, e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::SpawnFailed("tool stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::SpawnFailed("tool stdout not piped".to_string()))?;

        tokio::time::sleep(self.config.startup_grace).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                return Err(AdapterError::SpawnFailed(format!(
                    "{} exited immediately ({})",
                    self.config.command, status
                )));
            }
            Err(e) => return Err(AdapterError::SpawnFailed(e.to_string())),
        }

        tracing::info!(command = %self.config.command, pid = ?child.id(), "db tool started");
        *self.io.lock().await = Some(ToolIo {
            stdin,
            stdout: BufReader::new(stdout),
            pending: Vec::new(),
            writing: false,
        });
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        self.dead.store(false, Ordering::Release);
        Ok(())
    }

    async fn execute(&self, command: &ValidatedCommand, timeout: Duration) -> Result<Value, AdapterError> {
        let _busy = BusyGuard::acquire(&self.busy).ok_or(AdapterError::Busy)?;
        if self.dead.load(Ordering::Acquire) {
            return Err(AdapterError::SpawnFailed("tool process is no longer running".to_string()));
        }
        let mut io_guard = self.io.lock().await;
        let io = io_guard
            .as_mut()
            .ok_or_else(|| AdapterError::SpawnFailed("tool process not started".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = ToolRequest::new(id, command).to_line()?;
        let start = Instant::now();
        let timeout_ms = timeout.as_millis() as u64;
        let exchanged = tokio::time::timeout(timeout, self.exchange(io, &line, id)).await;
        let result = match exchanged {
            Ok(r) => r,
            Err(_) => {
                if io.writing {
                    io.writing = false;
                    self.mark_dead("request write interrupted by timeout");
                }
                Err(AdapterError::Timeout(timeout_ms))
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(AdapterError::RemoteError { .. }) => "remote_error",
            Err(AdapterError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "db_tool_audit",
            "id": id,
            "operation": command.kind.as_str(),
            "table": command.target_table,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit, "db_tool");

        result
    }

    fn healthy(&self) -> bool {
        if self.dead.load(Ordering::Acquire) {
            return false;
        }
        match self.child.lock() {
            Ok(mut guard) => guard
                .as_mut()
                .is_some_and(|c| matches!(c.try_wait(), Ok(None))),
            Err(_) => false,
        }
    }

    async fn shutdown(&self) {
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut child) = child else {
            return;
        };
        self.dead.store(true, Ordering::Release);

        // 关闭 stdin 即通知 stdio 工具退出
        drop(self.io.lock().await.take());

        match tokio::time::timeout(self.config.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(command = %self.config.command, %status, "db tool exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(command = %self.config.command, "waiting for db tool failed: {}", e);
            }
            Err(_) => {
                self.kill_attempts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    command = %self.config.command,
                    "db tool did not exit within {:?}, killing",
                    self.config.shutdown_grace
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("kill db tool failed: {}", e);
                }
            }
        }
    }
}
