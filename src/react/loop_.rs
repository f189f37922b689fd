//! Session 主循环
//!
//! Plan -> Classify -> (缓存命中 | 分类错误 | Dispatch) -> Observe -> 下一轮 Plan。
//! 下发次数上限固定为 10；Planner 与适配器调用都受超时约束，并可被取消令牌打断。
//! 任何终止路径都会关闭适配器进程并丢弃跟踪器，调用方只会拿到 SessionOutcome。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::adapter::DbAdapter;
use crate::config::AppConfig;
use crate::core::{AdapterError, PlannerError, RecoveryAction, RecoveryEngine, SessionError};
use crate::ops::{classify, Classified, ExecutionRecord, ExecutionTracker, Outcome};
use crate::react::{Observation, Planner, PlannerStep, PlanningContext, SessionEvent};

/// 单个会话内实际下发的最大次数
pub const MAX_ITERATIONS: usize = 10;
/// Observation 事件预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Done,
    Failed,
}

/// 会话超时与规划轮数限制
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub command_timeout: Duration,
    pub planner_timeout: Duration,
    /// Planner 调用总次数上限（缓存命中、分类错误不计下发，但计入此值）
    pub max_planner_turns: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            planner_timeout: Duration::from_secs(60),
            max_planner_turns: MAX_ITERATIONS * 3,
        }
    }
}

impl SessionLimits {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            command_timeout: Duration::from_secs(cfg.tool.request_timeout_secs),
            planner_timeout: Duration::from_secs(cfg.session.planner_timeout_secs),
            max_planner_turns: cfg.session.max_planner_turns.max(MAX_ITERATIONS),
        }
    }
}

/// 会话结果：最终回答或终止错误，均附带执行轨迹
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Done {
        answer: String,
        records: Vec<ExecutionRecord>,
    },
    Failed {
        #[serde(serialize_with = "serialize_error")]
        error: SessionError,
        records: Vec<ExecutionRecord>,
    },
}

fn serialize_error<S: serde::Serializer>(err: &SessionError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(err)
}

impl SessionOutcome {
    pub fn status(&self) -> SessionStatus {
        match self {
            SessionOutcome::Done { .. } => SessionStatus::Done,
            SessionOutcome::Failed { .. } => SessionStatus::Failed,
        }
    }

    pub fn answer(&self) -> Option<&str> {
        match self {
            SessionOutcome::Done { answer, .. } => Some(answer),
            SessionOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&SessionError> {
        match self {
            SessionOutcome::Failed { error, .. } => Some(error),
            SessionOutcome::Done { .. } => None,
        }
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        match self {
            SessionOutcome::Done { records, .. } | SessionOutcome::Failed { records, .. } => records,
        }
    }
}

/// 一次用户问题对应一个 Session：独占跟踪器与适配器，run 结束即销毁
pub struct Session {
    id: Uuid,
    tracker: ExecutionTracker,
    adapter: Box<dyn DbAdapter>,
    planner: Arc<dyn Planner>,
    recovery: RecoveryEngine,
    limits: SessionLimits,
    status: SessionStatus,
    cancel_token: CancellationToken,
    event_tx: Option<UnboundedSender<SessionEvent>>,
    observations: Vec<Observation>,
}

impl Session {
    pub fn new(
        adapter: Box<dyn DbAdapter>,
        planner: Arc<dyn Planner>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracker: ExecutionTracker::new(),
            adapter,
            planner,
            recovery: RecoveryEngine::new(),
            limits: SessionLimits::default(),
            status: SessionStatus::Active,
            cancel_token,
            event_tx: None,
            observations: Vec::new(),
        }
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<SessionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// 运行会话直到 DONE 或 FAILED；无论结果如何都会关闭适配器
    pub async fn run(mut self, query: &str) -> SessionOutcome {
        let span = tracing::info_span!("session", id = %self.id);
        async move {
            tracing::info!(query = %query, "session started");
            let result = self.drive(query).await;
            self.adapter.shutdown().await;

            let dispatches = self.tracker.iteration_count();
            match &result {
                Ok(answer) => {
                    self.status = SessionStatus::Done;
                    self.emit(SessionEvent::Done { answer: answer.clone() });
                    tracing::info!(dispatches, "session done");
                }
                Err(error) => {
                    self.status = SessionStatus::Failed;
                    self.emit(SessionEvent::Failed { reason: error.to_string() });
                    tracing::warn!(dispatches, "session failed: {}", error);
                }
            }

            let records = self.tracker.into_records();
            match result {
                Ok(answer) => SessionOutcome::Done { answer, records },
                Err(error) => SessionOutcome::Failed { error, records },
            }
        }
        .instrument(span)
        .await
    }

    fn emit(&self, ev: SessionEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn observe(&mut self, obs: Observation) {
        let text = obs.render();
        let preview: String = text.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
        let preview = if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
            format!("{}...", preview)
        } else {
            preview
        };
        self.emit(SessionEvent::Observation { preview });
        self.observations.push(obs);
    }

    fn apply(&mut self, action: RecoveryAction) -> Result<(), SessionError> {
        match action {
            RecoveryAction::RetryWithPrompt(text) => {
                self.observe(Observation::Correction { text });
                Ok(())
            }
            RecoveryAction::Abort(err) => Err(err),
        }
    }

    async fn drive(&mut self, query: &str) -> Result<String, SessionError> {
        or_cancel(&self.cancel_token, self.adapter.start())
            .await?
            .map_err(|e| SessionError::AdapterUnavailable(e.to_string()))?;

        let mut planner_turns = 0usize;
        let mut planner_failures = 0u32;
        let mut adapter_failures = 0u32;

        loop {
            if self.cancel_token.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let dispatches = self.tracker.iteration_count();
            if dispatches >= MAX_ITERATIONS {
                return Err(SessionError::MaxIterationsExceeded(MAX_ITERATIONS));
            }
            if planner_turns >= self.limits.max_planner_turns {
                tracing::warn!(planner_turns, dispatches, "planner turn limit reached");
                return Err(SessionError::MaxIterationsExceeded(MAX_ITERATIONS));
            }
            planner_turns += 1;
            self.emit(SessionEvent::IterationUpdate {
                dispatches,
                max_dispatches: MAX_ITERATIONS,
                planner_turn: planner_turns,
            });

            // Plan
            self.emit(SessionEvent::PlannerThinking);
            let planned = {
                let ctx = PlanningContext {
                    query,
                    observations: &self.observations,
                    records: self.tracker.records(),
                    max_iterations: MAX_ITERATIONS,
                };
                let timeout = self.limits.planner_timeout;
                let fut = tokio::time::timeout(timeout, self.planner.next_step(&ctx));
                match or_cancel(&self.cancel_token, fut).await? {
                    Ok(r) => r,
                    Err(_) => Err(PlannerError::Timeout(timeout.as_secs())),
                }
            };
            let step = match planned {
                Ok(step) => {
                    planner_failures = 0;
                    step
                }
                Err(e) => {
                    planner_failures += 1;
                    self.emit(SessionEvent::PlannerFailure { reason: e.to_string() });
                    let action = self.recovery.handle_planner(&e, planner_failures);
                    self.apply(action)?;
                    continue;
                }
            };
            let op = match step {
                PlannerStep::FinalAnswer(answer) => return Ok(answer),
                PlannerStep::Operation(op) => op,
            };
            tracing::info!(kind = %op.kind, table = ?op.target_table, rationale = %op.raw_rationale, "planned operation");
            self.emit(SessionEvent::Planned {
                operation: op.kind.clone(),
                table: op.target_table.clone(),
                rationale: op.raw_rationale.clone(),
            });

            // Classify
            let command = match classify(op, &self.tracker) {
                Ok(Classified::Dispatch(command)) => command,
                Ok(Classified::Resolved(entry)) => {
                    self.emit(SessionEvent::CacheHit { dedup_key: entry.dedup_key.clone() });
                    self.observe(Observation::Cached {
                        dedup_key: entry.dedup_key,
                        data: entry.result,
                    });
                    continue;
                }
                Err(e) => {
                    tracing::info!("operation rejected: {}", e);
                    self.emit(SessionEvent::ClassificationRejected { reason: e.to_string() });
                    let action = self.recovery.handle_classification(&e);
                    self.apply(action)?;
                    continue;
                }
            };

            // Act
            if !self.adapter.healthy() {
                return Err(SessionError::AdapterUnavailable(
                    "database tool process is not running".to_string(),
                ));
            }
            self.emit(SessionEvent::Dispatch {
                operation: command.kind.to_string(),
                table: command.target_table.clone(),
            });
            let executed = or_cancel(
                &self.cancel_token,
                self.adapter.execute(&command, self.limits.command_timeout),
            )
            .await?;

            // Observe
            match executed {
                Ok(data) => {
                    adapter_failures = 0;
                    self.tracker.record(&command, Outcome::Success, Some(&data));
                    self.observe(Observation::Result {
                        operation: command.kind.to_string(),
                        table: command.target_table.clone(),
                        data,
                    });
                }
                Err(e) => {
                    self.tracker.record(&command, Outcome::Error(e.to_string()), None);
                    if matches!(e, AdapterError::RemoteError { .. }) {
                        adapter_failures = 0;
                    } else {
                        adapter_failures += 1;
                    }
                    self.emit(SessionEvent::AdapterFailure {
                        operation: command.kind.to_string(),
                        reason: e.to_string(),
                    });
                    let action = self.recovery.handle_adapter(&e, adapter_failures.max(1));
                    self.apply(action)?;
                }
            }
        }
    }
}

/// 与取消令牌竞速；取消优先
async fn or_cancel<F: Future>(token: &CancellationToken, fut: F) -> Result<F::Output, SessionError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SessionError::Cancelled),
        out = fut => Ok(out),
    }
}
