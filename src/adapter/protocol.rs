//! 外部数据库工具的行协议
//!
//! 每条请求/响应为一行 JSON（换行分隔），同步一问一答，无流水线。
//! 请求: {"id": 1, "operation": "SELECT", "table": "orders", "params": {...}}
//! 响应: {"id": 1, "status": "ok"|"error", "data": ..., "error_code": ..., "error_message": ...}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AdapterError;
use crate::ops::{OperationKind, ValidatedCommand};

/// 单行响应上限，超过视为协议违规
pub const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct ToolRequest<'a> {
    pub id: u64,
    pub operation: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<&'a str>,
    pub params: &'a Map<String, Value>,
}

impl<'a> ToolRequest<'a> {
    pub fn new(id: u64, command: &'a ValidatedCommand) -> Self {
        Self {
            id,
            operation: command.kind,
            table: command.target_table.as_deref(),
            params: &command.parameters,
        }
    }

    /// 序列化为一行（含结尾换行）
    pub fn to_line(&self) -> Result<String, AdapterError> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| AdapterError::ProtocolViolation(format!("encode request: {e}")))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolResponse {
    #[serde(default)]
    pub id: Option<u64>,
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ToolResponse {
    pub fn parse(line: &str) -> Result<Self, AdapterError> {
        serde_json::from_str(line.trim()).map_err(|e| {
            let preview: String = line.trim().chars().take(200).collect();
            AdapterError::ProtocolViolation(format!("{e}: {preview}"))
        })
    }

    /// 响应是否属于另一条（已超时的）请求
    pub fn is_stale_for(&self, request_id: u64) -> bool {
        self.id.is_some_and(|id| id != request_id)
    }

    /// ok -> data（缺省为 null）；error -> RemoteError
    pub fn into_result(self) -> Result<Value, AdapterError> {
        match self.status {
            ResponseStatus::Ok => Ok(self.data.unwrap_or(Value::Null)),
            ResponseStatus::Error => Err(AdapterError::RemoteError {
                code: self.error_code.unwrap_or_else(|| "UNKNOWN".to_string()),
                message: self.error_message.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_line_shape() {
        let mut params = Map::new();
        params.insert("columns".into(), json!(["id"]));
        let cmd = ValidatedCommand {
            kind: OperationKind::Select,
            target_table: Some("orders".into()),
            parameters: params,
            dedup_key: None,
        };
        let line = ToolRequest::new(7, &cmd).to_line().unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            v,
            json!({"id": 7, "operation": "SELECT", "table": "orders", "params": {"columns": ["id"]}})
        );
    }

    #[test]
    fn test_list_tables_omits_table() {
        let cmd = ValidatedCommand {
            kind: OperationKind::ListTables,
            target_table: None,
            parameters: Map::new(),
            dedup_key: Some("LIST_TABLES".into()),
        };
        let v: Value = serde_json::from_str(&ToolRequest::new(1, &cmd).to_line().unwrap()).unwrap();
        assert!(v.get("table").is_none());
    }

    #[test]
    fn test_error_response_maps_to_remote_error() {
        let resp = ToolResponse::parse(
            r#"{"status":"error","error_code":"42P01","error_message":"no such table"}"#,
        )
        .unwrap();
        assert_eq!(
            resp.into_result(),
            Err(AdapterError::RemoteError {
                code: "42P01".into(),
                message: "no such table".into()
            })
        );
    }

    #[test]
    fn test_malformed_response_is_protocol_violation() {
        assert!(matches!(
            ToolResponse::parse("not json"),
            Err(AdapterError::ProtocolViolation(_))
        ));
        assert!(matches!(
            ToolResponse::parse(r#"{"status":"maybe"}"#),
            Err(AdapterError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_stale_detection() {
        let resp = ToolResponse::parse(r#"{"id":3,"status":"ok","data":[]}"#).unwrap();
        assert!(resp.is_stale_for(4));
        assert!(!resp.is_stale_for(3));
        let anonymous = ToolResponse::parse(r#"{"status":"ok"}"#).unwrap();
        assert!(!anonymous.is_stale_for(4));
        assert_eq!(anonymous.into_result(), Ok(Value::Null));
    }
}
