//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DBEE__*` 覆盖（双下划线表示嵌套，如 `DBEE__TOOL__COMMAND=docker`）。
//! 数据库连接串未配置时回退到 `DATABASE_URL`。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub tool: ToolSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [database] 段：连接串只在工具进程启动时传入一次
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

impl DatabaseSection {
    /// 配置优先，其次环境变量 DATABASE_URL
    pub fn resolved_url(&self) -> Option<String> {
        self.url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| std::env::var("DATABASE_URL").ok())
    }
}

/// [tool] 段：外部数据库工具命令与超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSection {
    #[serde(default = "default_tool_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 通过该环境变量把连接串交给工具；为空则不设置
    #[serde(default = "default_connection_env")]
    pub connection_env: Option<String>,
    /// 是否把连接串追加为最后一个参数（如 `docker run --rm -i image <url>`）
    #[serde(default)]
    pub connection_as_arg: bool,
    /// 单条命令超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_forward_stderr")]
    pub forward_stderr: bool,
}

fn default_tool_command() -> String {
    "dbtool".to_string()
}

fn default_connection_env() -> Option<String> {
    Some("DATABASE_URL".to_string())
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_startup_grace_ms() -> u64 {
    200
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_forward_stderr() -> bool {
    true
}

impl Default for ToolSection {
    fn default() -> Self {
        Self {
            command: default_tool_command(),
            args: Vec::new(),
            connection_env: default_connection_env(),
            connection_as_arg: false,
            request_timeout_secs: default_request_timeout_secs(),
            startup_grace_ms: default_startup_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            forward_stderr: default_forward_stderr(),
        }
    }
}

/// [session] 段：Planner 超时与规划轮数上限（下发次数上限固定为 10，不可配置）
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 含缓存命中与分类错误在内的 Planner 调用总次数上限
    #[serde(default = "default_max_planner_turns")]
    pub max_planner_turns: usize,
    #[serde(default = "default_planner_timeout_secs")]
    pub planner_timeout_secs: u64,
}

fn default_max_planner_turns() -> usize {
    30
}

fn default_planner_timeout_secs() -> u64 {
    60
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_planner_turns: default_max_planner_turns(),
            planner_timeout_secs: default_planner_timeout_secs(),
        }
    }
}

/// [llm] 段：OpenAI 兼容后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 DBEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DBEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DBEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
