//! 执行跟踪器
//!
//! 追加式 ExecutionRecord + 发现类操作结果缓存。DDL 执行后按作用域（单表 / 表目录）
//! 驱逐缓存，并推进该作用域的变更水位，保证缓存不会返回早于最近一次变更的结果。
//! 纯内存记账，无 I/O，不会失败。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::ops::{normalize_table, OperationKind, ValidatedCommand};

/// 单次下发的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Error(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// 执行记录（追加后不可变）
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub sequence_number: u64,
    pub kind: OperationKind,
    pub target_table: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

/// 缓存作用域：表目录（LIST_TABLES）或单表（DESCRIBE_TABLE）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    Catalog,
    Table(String),
}

impl Scope {
    /// 按去掉 schema 前缀后的表名分组：`public.orders` 与 `orders` 同属一个作用域，宁可多驱逐
    fn table(table: &str) -> Self {
        let name = normalize_table(table);
        match name.rsplit_once('.') {
            Some((_, unqualified)) => Scope::Table(unqualified.to_string()),
            None => Scope::Table(name),
        }
    }
}

/// 发现类操作的缓存条目
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub dedup_key: String,
    pub result: Value,
    pub captured_at: u64,
    scope: Scope,
}

/// 执行跟踪器：每个 Session 独占一个
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    records: Vec<ExecutionRecord>,
    cache: HashMap<String, CacheEntry>,
    /// 作用域 -> 最近一次使其失效的变更序号
    watermarks: HashMap<Scope, u64>,
    next_seq: u64,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 仅当条目捕获之后其作用域没有发生过失效变更时命中
    pub fn has_cached(&self, dedup_key: &str) -> Option<&CacheEntry> {
        let entry = self.cache.get(dedup_key)?;
        match self.watermarks.get(&entry.scope) {
            Some(&mutated_at) if mutated_at >= entry.captured_at => None,
            _ => Some(entry),
        }
    }

    /// 追加执行记录；成功的发现类结果写入缓存；DDL 无论结果如何都驱逐受影响作用域
    /// （超时的 DDL 可能已在数据库侧生效）
    pub fn record(&mut self, command: &ValidatedCommand, outcome: Outcome, result: Option<&Value>) {
        self.next_seq += 1;
        let seq = self.next_seq;

        if command.kind.is_ddl() {
            self.invalidate(command.kind, command.target_table.as_deref(), seq);
        }

        if command.kind.is_discovery() && outcome.is_success() {
            if let (Some(key), Some(result)) = (command.dedup_key.as_ref(), result) {
                let scope = match command.kind {
                    OperationKind::ListTables => Scope::Catalog,
                    _ => Scope::table(command.target_table.as_deref().unwrap_or_default()),
                };
                self.cache.insert(
                    key.clone(),
                    CacheEntry {
                        dedup_key: key.clone(),
                        result: result.clone(),
                        captured_at: seq,
                        scope,
                    },
                );
            }
        }

        self.records.push(ExecutionRecord {
            sequence_number: seq,
            kind: command.kind,
            target_table: command.target_table.clone(),
            outcome,
            timestamp: Utc::now(),
        });
    }

    fn invalidate(&mut self, kind: OperationKind, table: Option<&str>, seq: u64) {
        let mut scopes = Vec::with_capacity(2);
        if let Some(t) = table {
            scopes.push(Scope::table(t));
        }
        if kind.mutates_catalog() {
            scopes.push(Scope::Catalog);
        }
        for scope in scopes {
            let before = self.cache.len();
            self.cache.retain(|_, entry| entry.scope != scope);
            let evicted = before - self.cache.len();
            if evicted > 0 {
                tracing::debug!(?scope, evicted, "cache invalidated by {}", kind);
            }
            self.watermarks.insert(scope, seq);
        }
    }

    /// 实际下发次数（缓存命中、分类错误都不计入）
    pub fn iteration_count(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ExecutionRecord> {
        self.records
    }
}
