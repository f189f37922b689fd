//! 编排层：Planner 接缝、观察上下文、会话事件与 Session 主循环

pub mod events;
pub mod loop_;
pub mod observation;
pub mod planner;

pub use events::SessionEvent;
pub use loop_::{Session, SessionLimits, SessionOutcome, SessionStatus, MAX_ITERATIONS};
pub use observation::Observation;
pub use planner::{
    parse_planner_output, LlmPlanner, Planner, PlannerStep, PlanningContext, ScriptedPlanner,
};
