//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WEAVER__*` 覆盖（双下划线表示嵌套，如 `WEAVER__AGENT__MAX_ROUNDS=8`）。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::retry::{FailureKind, RetryPolicy};
use crate::graph::DEFAULT_MAX_CONCURRENT_TOOLS;
use crate::plan::ResolveMode;
use crate::planner::{ReplanMode, DEFAULT_MAX_ROUNDS};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub retry: RetrySections,
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；缺少对应 API Key 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [agent] 段：规划循环
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default)]
    pub replan_mode: ReplanMode,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    #[serde(default)]
    pub placeholder_mode: ResolveMode,
    /// 自定义 system prompt 模板（需包含 {{TOOLS_SPEC}}）
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            replan_mode: ReplanMode::default(),
            max_concurrent_tools: default_max_concurrent_tools(),
            placeholder_mode: ResolveMode::default(),
            system_prompt_path: None,
        }
    }
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

fn default_max_concurrent_tools() -> usize {
    DEFAULT_MAX_CONCURRENT_TOOLS
}

/// [retry] 段：[retry.llm] 与 [retry.tool]，未写出的键取各自的默认策略
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetrySections {
    pub llm: RetrySection,
    pub tool: RetrySection,
}

impl RetrySections {
    pub fn llm_policy(&self) -> RetryPolicy {
        self.llm.to_policy(&RetryPolicy::for_llm())
    }

    pub fn tool_policy(&self) -> RetryPolicy {
        self.tool.to_policy(&RetryPolicy::for_tools())
    }
}

/// 单个重试策略的配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySection {
    pub attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub jitter: Option<bool>,
    pub retry_on: Option<Vec<FailureKind>>,
}

impl RetrySection {
    /// 以 base 为底，覆盖配置中写出的键
    pub fn to_policy(&self, base: &RetryPolicy) -> RetryPolicy {
        RetryPolicy::new(
            self.attempts.unwrap_or(base.attempts()),
            self.initial_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(base.initial_backoff()),
            self.max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(base.max_backoff()),
            self.multiplier.unwrap_or(base.multiplier()),
            self.jitter.unwrap_or(base.jitter()),
            match &self.retry_on {
                Some(kinds) => kinds.iter().copied().collect::<HashSet<_>>(),
                None => base.retry_on().clone(),
            },
        )
    }
}

/// [tools] 段：工具超时与 web 工具参数
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub web: WebSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            web: WebSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.web] 段：搜索与抓取
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_web_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            max_search_results: default_max_search_results(),
        }
    }
}

fn default_web_timeout_secs() -> u64 {
    10
}

fn default_max_result_chars() -> usize {
    10_000
}

fn default_max_search_results() -> usize {
    5
}

/// 从 config 目录加载配置，环境变量 WEAVER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WEAVER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignored");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WEAVER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时记录警告并回退到默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_rounds, 6);
        assert_eq!(cfg.agent.replan_mode, ReplanMode::PerRound);
        assert_eq!(cfg.agent.max_concurrent_tools, 3);
        assert_eq!(cfg.agent.placeholder_mode, ResolveMode::Textual);
        assert_eq!(cfg.retry.llm_policy(), RetryPolicy::for_llm());
        assert_eq!(cfg.retry.tool_policy(), RetryPolicy::for_tools());
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert_eq!(cfg.tools.web.max_search_results, 5);
    }

    #[test]
    fn test_load_explicit_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[llm]
provider = "mock"

[agent]
max_rounds = 9
replan_mode = "per_task"
placeholder_mode = "structured"

[retry.tool]
attempts = 4
retry_on = ["timeout"]
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.agent.max_rounds, 9);
        assert_eq!(cfg.agent.replan_mode, ReplanMode::PerTask);
        assert_eq!(cfg.agent.placeholder_mode, ResolveMode::Structured);

        let tool = cfg.retry.tool_policy();
        assert_eq!(tool.attempts(), 4);
        assert!(tool.should_retry(FailureKind::Timeout));
        assert!(!tool.should_retry(FailureKind::Server));
        // 未写出的键保持各自默认
        assert_eq!(tool.initial_backoff(), Duration::from_millis(200));
        assert_eq!(cfg.retry.llm_policy(), RetryPolicy::for_llm());
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[agent]\nmax_rounds = \"many\"").unwrap();
        assert!(load_config(Some(file.path().to_path_buf())).is_err());
        let cfg = load_config_or_default(Some(file.path().to_path_buf()));
        assert_eq!(cfg.agent.max_rounds, 6);
    }
}
