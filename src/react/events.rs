//! 会话过程事件：用于日志、流式前端展示规划、下发、缓存命中与失败

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 下发计数更新
    IterationUpdate {
        dispatches: usize,
        max_dispatches: usize,
        planner_turn: usize,
    },
    /// 正在调用 Planner
    PlannerThinking,
    /// Planner 给出的下一步
    Planned {
        operation: String,
        table: Option<String>,
        rationale: String,
    },
    /// 经适配器下发
    Dispatch {
        operation: String,
        table: Option<String>,
    },
    /// 发现类操作命中缓存，未下发
    CacheHit { dedup_key: String },
    /// 分类阶段拒绝
    ClassificationRejected { reason: String },
    /// 写回上下文的观察（预览）
    Observation { preview: String },
    /// 执行层失败（超时、协议错误、远端错误等）
    AdapterFailure { operation: String, reason: String },
    /// Planner 调用失败
    PlannerFailure { reason: String },
    /// 最终回答
    Done { answer: String },
    /// 会话终止
    Failed { reason: String },
}
