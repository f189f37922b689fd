//! dbee - 自然语言数据库助手的编排引擎
//!
//! 模块划分：
//! - **adapter**: 外部数据库工具的子进程协议适配器（行分隔 JSON over stdio）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话监管、关闭处理、编排器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Scripted）
//! - **observability**: 日志初始化
//! - **ops**: 操作词表、分类校验、执行跟踪与发现缓存
//! - **react**: Planner、观察上下文、Session 主循环

pub mod adapter;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod ops;
pub mod react;

pub use core::Orchestrator;
pub use react::{Session, SessionOutcome, SessionStatus};
