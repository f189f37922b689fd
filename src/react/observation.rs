//! 会话内累积的观察：每轮结果写回上下文，供下一轮 Planner 使用

use serde::Serialize;
use serde_json::Value;

/// 结果预览最大字符数（写入 prompt 的单条观察）
const OBSERVATION_MAX_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Observation {
    /// 实际下发后的结果
    Result {
        operation: String,
        table: Option<String>,
        data: Value,
    },
    /// 缓存命中，未下发
    Cached { dedup_key: String, data: Value },
    /// 分类错误、执行失败、远端错误等纠正信号
    Correction { text: String },
}

impl Observation {
    /// 渲染为写入 prompt 的文本（过长时截断）
    pub fn render(&self) -> String {
        let text = match self {
            Observation::Result { operation, table, data } => format!(
                "{} {} -> {}",
                operation,
                table.as_deref().unwrap_or(""),
                data
            ),
            Observation::Cached { dedup_key, data } => {
                format!("{} (already known) -> {}", dedup_key, data)
            }
            Observation::Correction { text } => text.clone(),
        };
        if text.chars().count() > OBSERVATION_MAX_CHARS {
            let cut: String = text.chars().take(OBSERVATION_MAX_CHARS).collect();
            format!("{}...", cut)
        } else {
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_render_truncates_large_results() {
        let rows: Vec<Value> = (0..2000).map(|i| json!({"id": i})).collect();
        let obs = Observation::Result {
            operation: "SELECT".into(),
            table: Some("orders".into()),
            data: Value::Array(rows),
        };
        let text = obs.render();
        assert!(text.starts_with("SELECT orders -> "));
        assert!(text.ends_with("..."));
        assert_eq!(text.chars().count(), OBSERVATION_MAX_CHARS + 3);
    }

    #[test]
    fn test_render_cached() {
        let obs = Observation::Cached {
            dedup_key: "LIST_TABLES".into(),
            data: json!(["orders"]),
        };
        assert_eq!(obs.render(), r#"LIST_TABLES (already known) -> ["orders"]"#);
    }
}
