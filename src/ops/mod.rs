//! 操作层：词表、分类校验、执行跟踪与发现缓存

pub mod classifier;
pub mod kind;
pub mod tracker;

pub use classifier::{classify, Classified};
pub use kind::{dedup_key, normalize_table, IntendedOperation, OperationKind, ValidatedCommand};
pub use tracker::{CacheEntry, ExecutionRecord, ExecutionTracker, Outcome};
