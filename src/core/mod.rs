//! 核心层：错误与恢复、会话监管、关闭处理、编排器

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;

pub use error::{AdapterError, ClassificationError, PlannerError, RecoveryAction, SessionError};
pub use orchestrator::Orchestrator;
pub use recovery::RecoveryEngine;
pub use session_supervisor::{SessionSupervisor, SessionTicket};
pub use shutdown::{ShutdownManager, ShutdownReason};
