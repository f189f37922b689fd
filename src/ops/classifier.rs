//! 操作分类器
//!
//! 将 IntendedOperation 映射到固定词表、按种类校验必需参数，并对发现类操作查询缓存：
//! 命中则直接返回缓存结果（不下发），这是避免重复发现调用的核心路径。
//! 无 I/O，给定输入与跟踪器状态时结果确定。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::ClassificationError;
use crate::ops::{dedup_key, CacheEntry, ExecutionTracker, IntendedOperation, OperationKind, ValidatedCommand};

/// 分类结果
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// 需要经适配器下发
    Dispatch(ValidatedCommand),
    /// 缓存命中，本地解决
    Resolved(CacheEntry),
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$").expect("static regex")
    })
}

/// 分类并校验一条意图操作
pub fn classify(
    op: IntendedOperation,
    tracker: &ExecutionTracker,
) -> Result<Classified, ClassificationError> {
    let kind: OperationKind = op
        .kind
        .parse()
        .map_err(ClassificationError::UnsupportedOperation)?;

    let target_table = match op.target_table.as_deref().map(str::trim) {
        // LIST_TABLES 不带表，多余的 table 字段直接忽略
        _ if !kind.requires_table() => None,
        Some(t) if !t.is_empty() => {
            if !identifier_re().is_match(t) {
                return Err(invalid(format!("'{t}' is not a valid table name")));
            }
            Some(t.to_string())
        }
        _ => return Err(invalid(format!("{kind} requires a target table"))),
    };

    validate_params(kind, &op.parameters)?;

    let key = dedup_key(kind, target_table.as_deref());
    if let Some(k) = key.as_deref() {
        if let Some(entry) = tracker.has_cached(k) {
            tracing::debug!(key = %k, captured_at = entry.captured_at, "discovery resolved from cache");
            return Ok(Classified::Resolved(entry.clone()));
        }
    }

    Ok(Classified::Dispatch(ValidatedCommand {
        kind,
        target_table,
        parameters: op.parameters,
        dedup_key: key,
    }))
}

fn invalid(detail: impl Into<String>) -> ClassificationError {
    ClassificationError::InvalidParameters(detail.into())
}

fn validate_params(kind: OperationKind, params: &Map<String, Value>) -> Result<(), ClassificationError> {
    match kind {
        OperationKind::ListTables | OperationKind::DescribeTable | OperationKind::DropTable => Ok(()),
        OperationKind::Select => {
            let columns = params.get("columns").is_some_and(is_string_list);
            let filter = params.get("filter").is_some_and(is_non_empty_condition);
            if columns || filter {
                Ok(())
            } else {
                Err(invalid("SELECT requires a non-empty 'columns' list or 'filter'"))
            }
        }
        OperationKind::Insert => match params.get("values") {
            Some(Value::Object(m)) if !m.is_empty() => Ok(()),
            Some(Value::Array(rows))
                if !rows.is_empty()
                    && rows.iter().all(|r| r.as_object().is_some_and(|m| !m.is_empty())) =>
            {
                Ok(())
            }
            _ => Err(invalid("INSERT requires non-empty 'values' (object or array of objects)")),
        },
        OperationKind::Update => {
            if !params.get("values").and_then(Value::as_object).is_some_and(|m| !m.is_empty()) {
                return Err(invalid("UPDATE requires a non-empty 'values' object"));
            }
            require_condition(kind, params)
        }
        OperationKind::Delete => require_condition(kind, params),
        OperationKind::CreateTable => {
            let ok = params.get("columns").and_then(Value::as_array).is_some_and(|cols| {
                !cols.is_empty()
                    && cols.iter().all(|c| {
                        ["name", "type"].iter().all(|f| {
                            c.get(f).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty())
                        })
                    })
            });
            if ok {
                Ok(())
            } else {
                Err(invalid("CREATE_TABLE requires 'columns': [{\"name\": ..., \"type\": ...}, ...]"))
            }
        }
        OperationKind::CreateIndex => {
            if params.get("columns").is_some_and(is_string_list) {
                Ok(())
            } else {
                Err(invalid("CREATE_INDEX requires a non-empty 'columns' list"))
            }
        }
    }
}

fn require_condition(kind: OperationKind, params: &Map<String, Value>) -> Result<(), ClassificationError> {
    if params.get("where").is_some_and(is_non_empty_condition) {
        Ok(())
    } else {
        Err(invalid(format!("{kind} requires a non-empty 'where' condition")))
    }
}

fn is_string_list(v: &Value) -> bool {
    v.as_array().is_some_and(|items| {
        !items.is_empty()
            && items
                .iter()
                .all(|i| i.as_str().is_some_and(|s| !s.trim().is_empty()))
    })
}

fn is_non_empty_condition(v: &Value) -> bool {
    match v {
        Value::Object(m) => !m.is_empty(),
        Value::String(s) => !s.trim().is_empty(),
        _ => false,
    }
}
