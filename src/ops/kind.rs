//! 操作词表与命令类型
//!
//! OperationKind 为固定闭集；IntendedOperation 为 Planner 每轮产出的原始意图，
//! ValidatedCommand 为分类校验后可直接下发给外部工具的命令。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 固定的数据库操作种类（运行时不可扩展）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    ListTables,
    DescribeTable,
    Select,
    Insert,
    CreateTable,
    DropTable,
    CreateIndex,
    Update,
    Delete,
}

impl OperationKind {
    pub const ALL: [OperationKind; 9] = [
        OperationKind::ListTables,
        OperationKind::DescribeTable,
        OperationKind::Select,
        OperationKind::Insert,
        OperationKind::CreateTable,
        OperationKind::DropTable,
        OperationKind::CreateIndex,
        OperationKind::Update,
        OperationKind::Delete,
    ];

    /// 线上格式名（如 LIST_TABLES）
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ListTables => "LIST_TABLES",
            OperationKind::DescribeTable => "DESCRIBE_TABLE",
            OperationKind::Select => "SELECT",
            OperationKind::Insert => "INSERT",
            OperationKind::CreateTable => "CREATE_TABLE",
            OperationKind::DropTable => "DROP_TABLE",
            OperationKind::CreateIndex => "CREATE_INDEX",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }

    /// 只读且结果在显式变更前稳定的发现类操作，可缓存
    pub fn is_discovery(&self) -> bool {
        matches!(self, OperationKind::ListTables | OperationKind::DescribeTable)
    }

    /// DDL 类操作：执行后使相关表（及表目录）的缓存失效
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            OperationKind::CreateTable | OperationKind::DropTable | OperationKind::CreateIndex
        )
    }

    /// 会改变表目录（表清单）的操作
    pub fn mutates_catalog(&self) -> bool {
        matches!(self, OperationKind::CreateTable | OperationKind::DropTable)
    }

    /// 除 LIST_TABLES 外都需要目标表
    pub fn requires_table(&self) -> bool {
        !matches!(self, OperationKind::ListTables)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    /// 大小写不敏感，`-` 与空格视同 `_`（"list tables"、"describe-table" 均可）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| s.trim().to_string())
    }
}

/// Planner 每轮产出的意图操作；kind 保留原始字符串，未知种类交由分类器拒绝
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntendedOperation {
    pub kind: String,
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// 仅用于日志
    #[serde(default)]
    pub raw_rationale: String,
}

impl IntendedOperation {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.target_table = Some(table.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.raw_rationale = rationale.into();
        self
    }
}

/// 分类校验通过、可下发的命令；发现类操作带 dedup_key
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCommand {
    pub kind: OperationKind,
    pub target_table: Option<String>,
    pub parameters: Map<String, Value>,
    pub dedup_key: Option<String>,
}

/// 表名归一化：去空白 + ASCII 小写（未加引号的 SQL 标识符大小写不敏感）
pub fn normalize_table(table: &str) -> String {
    table.trim().to_ascii_lowercase()
}

/// 由 (kind, target_table) 推导确定性的去重键；非发现类操作返回 None
pub fn dedup_key(kind: OperationKind, target_table: Option<&str>) -> Option<String> {
    match kind {
        OperationKind::ListTables => Some(kind.as_str().to_string()),
        OperationKind::DescribeTable => {
            target_table.map(|t| format!("{}:{}", kind.as_str(), normalize_table(t)))
        }
        _ => None,
    }
}
