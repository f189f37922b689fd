//! 编排器：每个用户问题一个 Session
//!
//! 负责：按配置为每次问题新建工具进程适配器与 Session，挂到 SessionSupervisor 下运行，
//! 多个问题可并发处理，彼此不共享跟踪器或进程。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::adapter::{DbAdapter, ProcessAdapter, ProcessAdapterConfig};
use crate::config::AppConfig;
use crate::core::SessionSupervisor;
use crate::llm::create_llm_from_config;
use crate::react::{LlmPlanner, Planner, Session, SessionEvent, SessionLimits, SessionOutcome};

type AdapterFactory = dyn Fn() -> Box<dyn DbAdapter> + Send + Sync;

pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    limits: SessionLimits,
    supervisor: SessionSupervisor,
    adapter_factory: Box<AdapterFactory>,
}

impl Orchestrator {
    /// 由配置构建：LLM Planner + 外部工具进程适配器
    pub fn from_config(cfg: &AppConfig, supervisor: SessionSupervisor) -> anyhow::Result<Self> {
        let llm = create_llm_from_config(cfg)?;
        let planner: Arc<dyn Planner> = Arc::new(LlmPlanner::new(llm));

        let connection = cfg.database.resolved_url();
        if connection.is_none() {
            tracing::warn!("No database URL configured (database.url / DATABASE_URL)");
        }
        let adapter_cfg = ProcessAdapterConfig::from_section(&cfg.tool, connection);
        tracing::info!(command = %adapter_cfg.command, "db tool configured");

        Ok(Self::new(planner, SessionLimits::from_config(cfg), supervisor)
            .with_adapter_factory(move || -> Box<dyn DbAdapter> {
                Box::new(ProcessAdapter::new(adapter_cfg.clone()))
            }))
    }

    /// 默认适配器工厂为未配置的 `dbtool` 进程；测试或嵌入方通常用 with_adapter_factory 替换
    pub fn new(planner: Arc<dyn Planner>, limits: SessionLimits, supervisor: SessionSupervisor) -> Self {
        Self {
            planner,
            limits,
            supervisor,
            adapter_factory: Box::new(|| -> Box<dyn DbAdapter> {
                Box::new(ProcessAdapter::new(ProcessAdapterConfig::new("dbtool")))
            }),
        }
    }

    pub fn with_adapter_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn DbAdapter> + Send + Sync + 'static,
    {
        self.adapter_factory = Box::new(factory);
        self
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 处理一个用户问题：新建 Session（独立进程与跟踪器）并运行到结束
    pub async fn answer(&self, query: &str) -> SessionOutcome {
        self.answer_with_events(query, None).await
    }

    pub async fn answer_with_events(
        &self,
        query: &str,
        event_tx: Option<UnboundedSender<SessionEvent>>,
    ) -> SessionOutcome {
        let ticket = self.supervisor.begin();
        let mut session = Session::new((self.adapter_factory)(), Arc::clone(&self.planner), ticket.token())
            .with_limits(self.limits.clone());
        if let Some(tx) = event_tx {
            session = session.with_event_tx(tx);
        }
        session.run(query).await
    }
}
