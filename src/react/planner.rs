//! Planner：根据用户问题与已有观察给出下一步数据库操作或最终回答
//!
//! Planner trait 是 Session 与自然语言理解之间的接缝；LlmPlanner 调用 LLM 并解析 JSON 步骤，
//! ScriptedPlanner 按脚本返回步骤供测试使用。

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::PlannerError;
use crate::llm::{LlmClient, Message};
use crate::ops::{ExecutionRecord, IntendedOperation, Outcome};
use crate::react::Observation;

/// Planner 单步输出
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerStep {
    /// 需要执行的下一步操作
    Operation(IntendedOperation),
    /// 已可回答用户
    FinalAnswer(String),
}

/// 每轮交给 Planner 的上下文
#[derive(Debug, Clone, Copy)]
pub struct PlanningContext<'a> {
    pub query: &'a str,
    pub observations: &'a [Observation],
    pub records: &'a [ExecutionRecord],
    pub max_iterations: usize,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn next_step(&self, ctx: &PlanningContext<'_>) -> Result<PlannerStep, PlannerError>;
}

/// LLM 输出的 JSON 步骤；兼容 kind / target_table / parameters 等别名
#[derive(Debug, Deserialize)]
struct StepJson {
    #[serde(default, alias = "kind")]
    operation: Option<String>,
    #[serde(default, alias = "target_table")]
    table: Option<String>,
    #[serde(default, alias = "parameters")]
    params: Option<Map<String, Value>>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    final_answer: Option<String>,
}

/// 解析 LLM 输出：含 JSON 时解析为操作或 final_answer，否则整段文本作为最终回答
pub fn parse_planner_output(output: &str) -> Result<PlannerStep, PlannerError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(PlannerError::MalformedOutput("empty output".to_string()));
    }

    // 尝试提取 JSON 块（```json ... ``` 或纯 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) if end > start => &trimmed[start..=end],
            _ => trimmed,
        }
    } else {
        return Ok(PlannerStep::FinalAnswer(trimmed.to_string()));
    };

    let parsed: StepJson = serde_json::from_str(json_str)
        .map_err(|e| PlannerError::MalformedOutput(format!("{}: {}", e, json_str)))?;

    if let Some(answer) = parsed.final_answer.filter(|a| !a.trim().is_empty()) {
        return Ok(PlannerStep::FinalAnswer(answer));
    }
    match parsed.operation.filter(|o| !o.trim().is_empty()) {
        Some(kind) => Ok(PlannerStep::Operation(IntendedOperation {
            kind,
            target_table: parsed.table,
            parameters: parsed.params.unwrap_or_default(),
            raw_rationale: parsed.rationale.unwrap_or_default(),
        })),
        None => Err(PlannerError::MalformedOutput(format!(
            "neither 'operation' nor 'final_answer' in {}",
            json_str
        ))),
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a database assistant. Answer the user's question by issuing structured database operations one at a time.

Available operations:
- LIST_TABLES: no table, no params
- DESCRIBE_TABLE: table required
- SELECT: table required; params {"columns": [...]} and/or {"filter": {...} or "sql condition"}, optional "limit", "order_by"
- INSERT: table required; params {"values": {...} or [{...}, ...]}
- UPDATE: table required; params {"values": {...}, "where": {...} or "sql condition"}
- DELETE: table required; params {"where": {...} or "sql condition"}
- CREATE_TABLE: table required; params {"columns": [{"name": "...", "type": "..."}, ...]}
- DROP_TABLE: table required
- CREATE_INDEX: table required; params {"columns": [...]}, optional "name", "unique"

Reply with exactly one JSON object and nothing else:
{"operation": "SELECT", "table": "orders", "params": {"columns": ["id"]}, "rationale": "why"}
When you can answer, reply with:
{"final_answer": "a clear explanation of what was done and the results"}

Discovery results (LIST_TABLES, DESCRIBE_TABLE) do not change unless you alter the schema; do not repeat them."#;

/// 基于 LLM 的 Planner：拼 system + 用户问题 + 观察历史后调用 LLM
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn build_messages(&self, ctx: &PlanningContext<'_>) -> Vec<Message> {
        let mut system = self.system_prompt.clone();
        let _ = write!(
            system,
            "\n\nDispatches used: {}/{}",
            ctx.records.len(),
            ctx.max_iterations
        );
        if !ctx.records.is_empty() {
            system.push_str("\nExecuted so far:");
            for r in ctx.records {
                let outcome = match &r.outcome {
                    Outcome::Success => "ok".to_string(),
                    Outcome::Error(e) => format!("error: {}", e),
                };
                let _ = write!(
                    system,
                    "\n{}. {} {} -> {}",
                    r.sequence_number,
                    r.kind,
                    r.target_table.as_deref().unwrap_or("-"),
                    outcome
                );
            }
        }

        let mut messages = vec![Message::system(system), Message::user(ctx.query)];
        for obs in ctx.observations {
            match obs {
                Observation::Result { operation, table, .. } => {
                    messages.push(Message::assistant(format!(
                        "Operation: {} {}",
                        operation,
                        table.as_deref().unwrap_or("")
                    )));
                    messages.push(Message::user(format!("Observation: {}", obs.render())));
                }
                _ => messages.push(Message::user(obs.render())),
            }
        }
        messages
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn next_step(&self, ctx: &PlanningContext<'_>) -> Result<PlannerStep, PlannerError> {
        let messages = self.build_messages(ctx);
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(PlannerError::Llm)?;
        tracing::debug!(output = %output, "planner output");
        parse_planner_output(&output)
    }
}

/// 按脚本依次返回步骤的 Planner（用于测试）；记录每轮看到的观察数量
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    steps: Mutex<VecDeque<Result<PlannerStep, PlannerError>>>,
    observed: Mutex<Vec<Vec<Observation>>>,
}

impl ScriptedPlanner {
    pub fn new(steps: impl IntoIterator<Item = PlannerStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().map(Ok).collect()),
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn from_results(steps: impl IntoIterator<Item = Result<PlannerStep, PlannerError>>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            observed: Mutex::new(Vec::new()),
        }
    }

    /// 每次被调用时的观察快照
    pub fn observed(&self) -> Vec<Vec<Observation>> {
        self.observed.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.observed.lock().map(|o| o.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn next_step(&self, ctx: &PlanningContext<'_>) -> Result<PlannerStep, PlannerError> {
        if let Ok(mut observed) = self.observed.lock() {
            observed.push(ctx.observations.to_vec());
        }
        self.steps
            .lock()
            .map_err(|e| PlannerError::Llm(e.to_string()))?
            .pop_front()
            .unwrap_or_else(|| Err(PlannerError::Llm("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[test]
    fn test_parse_operation_json() {
        let out = r#"{"operation": "SELECT", "table": "orders", "params": {"filter": {"status": "delayed"}}, "rationale": "find delayed"}"#;
        match parse_planner_output(out).unwrap() {
            PlannerStep::Operation(op) => {
                assert_eq!(op.kind, "SELECT");
                assert_eq!(op.target_table.as_deref(), Some("orders"));
                assert_eq!(op.parameters.get("filter"), Some(&json!({"status": "delayed"})));
                assert_eq!(op.raw_rationale, "find delayed");
            }
            other => panic!("Expected Operation, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_fenced_json_with_aliases() {
        let out = "Let me look.\n```json\n{\"kind\": \"DESCRIBE_TABLE\", \"target_table\": \"users\"}\n```";
        match parse_planner_output(out).unwrap() {
            PlannerStep::Operation(op) => {
                assert_eq!(op.kind, "DESCRIBE_TABLE");
                assert_eq!(op.target_table.as_deref(), Some("users"));
            }
            other => panic!("Expected Operation, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_final_answer_and_plain_text() {
        assert_eq!(
            parse_planner_output(r#"{"final_answer": "There are 3 delayed orders."}"#).unwrap(),
            PlannerStep::FinalAnswer("There are 3 delayed orders.".into())
        );
        assert_eq!(
            parse_planner_output("No tables exist yet.").unwrap(),
            PlannerStep::FinalAnswer("No tables exist yet.".into())
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_planner_output(r#"{"operation": "SELECT", "#),
            Err(PlannerError::MalformedOutput(_))
        ));
        assert!(matches!(
            parse_planner_output(r#"{"rationale": "hmm"}"#),
            Err(PlannerError::MalformedOutput(_))
        ));
        assert!(matches!(parse_planner_output("   "), Err(PlannerError::MalformedOutput(_))));
    }

    #[tokio::test]
    async fn test_llm_planner_includes_history() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"final_answer": "done"}"#]));
        let planner = LlmPlanner::new(llm.clone());
        let observations = vec![
            Observation::Result {
                operation: "LIST_TABLES".into(),
                table: None,
                data: json!(["orders"]),
            },
            Observation::Correction {
                text: "SELECT requires columns".into(),
            },
        ];
        let ctx = PlanningContext {
            query: "how many orders are delayed?",
            observations: &observations,
            records: &[],
            max_iterations: 10,
        };

        let step = planner.next_step(&ctx).await.unwrap();
        assert_eq!(step, PlannerStep::FinalAnswer("done".into()));

        let seen = llm.seen();
        assert_eq!(seen.len(), 1);
        let msgs = &seen[0];
        assert!(msgs[0].content.contains("Dispatches used: 0/10"));
        assert_eq!(msgs[1].content, "how many orders are delayed?");
        assert!(msgs.iter().any(|m| m.content.contains("orders")));
        assert!(msgs.last().unwrap().content.contains("SELECT requires columns"));
    }

    #[tokio::test]
    async fn test_llm_error_maps_to_planner_error() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        llm.push_error("rate limited");
        let planner = LlmPlanner::new(llm);
        let ctx = PlanningContext {
            query: "q",
            observations: &[],
            records: &[],
            max_iterations: 10,
        };
        assert_eq!(
            planner.next_step(&ctx).await,
            Err(PlannerError::Llm("rate limited".into()))
        );
    }
}
