//! Agent 构建器：由 AppConfig 组装 LLM、工具、Planner、Scheduler 与 AgentManager
//!
//! CLI 与测试共用同一套装配逻辑；测试可通过 with_llm / with_tools / with_retry_executor 注入替身。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::retry::RetryExecutor;
use crate::core::AgentError;
use crate::graph::Scheduler;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::planner::{AgentManager, AgentManagerConfig, Planner, DEFAULT_SYSTEM_PROMPT, TOOLS_SPEC_SLOT};
use crate::tools::{AddTool, FetchUrlTool, ToolExecutor, ToolRegistry, WebSearchTool};

const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// 实际使用的模型后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    DeepSeek,
    OpenAi,
    Mock,
}

/// 根据配置的 provider 与可用的 API Key 决定后端
///
/// deepseek 端点兼容 OpenAI 协议，只有 OPENAI_API_KEY 时也可使用；
/// 找不到对应 Key 或 provider 未知时回退到 mock。
pub fn select_provider(provider: &str, has_deepseek_key: bool, has_openai_key: bool) -> LlmProvider {
    match provider.trim().to_lowercase().as_str() {
        "mock" => LlmProvider::Mock,
        "deepseek" if has_deepseek_key || has_openai_key => LlmProvider::DeepSeek,
        "openai" if has_openai_key => LlmProvider::OpenAi,
        _ => LlmProvider::Mock,
    }
}

/// 按配置与环境变量创建 LLM 客户端
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();
    let timeout = Duration::from_secs(cfg.llm.timeouts.request);

    match select_provider(&cfg.llm.provider, has_deepseek_key, has_openai_key) {
        LlmProvider::DeepSeek => {
            let client = OpenAiClient::deepseek(cfg.llm.model.as_deref(), timeout);
            tracing::info!(model = client.model(), "using DeepSeek LLM");
            Arc::new(client)
        }
        LlmProvider::OpenAi => {
            let model = cfg.llm.model.as_deref().unwrap_or(OPENAI_DEFAULT_MODEL);
            let key = std::env::var("OPENAI_API_KEY").ok();
            tracing::info!(model, base_url = ?cfg.llm.base_url, "using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                model,
                key.as_deref(),
                timeout,
            ))
        }
        LlmProvider::Mock => {
            if cfg.llm.provider.trim().eq_ignore_ascii_case("mock") {
                tracing::info!("using mock LLM");
            } else {
                tracing::warn!(provider = %cfg.llm.provider, "no API key set or provider unknown, using mock LLM");
            }
            Arc::new(MockLlmClient::new())
        }
    }
}

/// Agent 构建器
pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    tools: Option<ToolRegistry>,
    retry: RetryExecutor,
    system_prompt: Option<String>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            tools: None,
            retry: RetryExecutor::new(),
            system_prompt: None,
        }
    }

    /// 指定 LLM 客户端，跳过 provider 选择
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 指定工具注册表，替代内置工具
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_retry_executor(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// 直接给出 system prompt 模板（优先于 agent.system_prompt_path）
    pub fn with_system_prompt(mut self, template: impl Into<String>) -> Self {
        self.system_prompt = Some(template.into());
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 内置工具：add_a_b、web_search、fetch_url
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let web = &self.config.tools.web;
        let mut tools = ToolRegistry::new();
        tools.register(AddTool);
        tools.register(WebSearchTool::new(web.timeout_secs).with_default_max_results(web.max_search_results));
        tools.register(FetchUrlTool::new(web.timeout_secs, web.max_result_chars));
        tools
    }

    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        match &self.llm {
            Some(llm) => Arc::clone(llm),
            None => create_llm_from_config(&self.config),
        }
    }

    /// system prompt 模板：显式设置 > agent.system_prompt_path > 内置默认
    pub fn load_system_prompt(&self) -> Result<String, AgentError> {
        if let Some(template) = &self.system_prompt {
            return Ok(template.clone());
        }
        let Some(path) = &self.config.agent.system_prompt_path else {
            return Ok(DEFAULT_SYSTEM_PROMPT.to_string());
        };
        let template = read_prompt(path)?;
        if !template.contains(TOOLS_SPEC_SLOT) {
            tracing::warn!(path = %path.display(), slot = TOOLS_SPEC_SLOT, "system prompt has no tools slot, tools will not be listed");
        }
        Ok(template)
    }

    /// 组装 AgentManager
    pub fn build(mut self) -> Result<AgentManager, AgentError> {
        let agent = &self.config.agent;
        if agent.max_rounds == 0 {
            return Err(AgentError::Config("agent.max_rounds must be at least 1".into()));
        }
        if agent.max_concurrent_tools == 0 {
            return Err(AgentError::Config("agent.max_concurrent_tools must be at least 1".into()));
        }

        let template = self.load_system_prompt()?;
        let llm = self.build_llm();
        let registry = match self.tools.take() {
            Some(tools) => tools,
            None => self.build_tool_registry(),
        };
        let AgentBuilder { config, retry, .. } = self;

        let executor = Arc::new(ToolExecutor::new(registry, config.tools.tool_timeout_secs));
        let planner = Planner::new(
            llm,
            &template,
            &executor.schema_json(),
            retry.clone(),
            config.retry.llm_policy(),
        );
        let scheduler = Scheduler::new(executor, retry, config.retry.tool_policy())
            .with_max_concurrency(config.agent.max_concurrent_tools)
            .with_resolve_mode(config.agent.placeholder_mode);

        tracing::debug!(
            max_rounds = config.agent.max_rounds,
            replan_mode = %config.agent.replan_mode,
            tools = ?scheduler.tools().tool_names(),
            "agent assembled"
        );

        Ok(AgentManager::new(
            planner,
            scheduler,
            AgentManagerConfig {
                max_rounds: config.agent.max_rounds,
                replan_mode: config.agent.replan_mode,
            },
        ))
    }
}

fn read_prompt(path: &Path) -> Result<String, AgentError> {
    std::fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("cannot read system prompt {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_select_provider() {
        assert_eq!(select_provider("deepseek", true, false), LlmProvider::DeepSeek);
        assert_eq!(select_provider("deepseek", false, true), LlmProvider::DeepSeek);
        assert_eq!(select_provider("DeepSeek", false, false), LlmProvider::Mock);
        assert_eq!(select_provider("openai", false, true), LlmProvider::OpenAi);
        assert_eq!(select_provider("openai", true, false), LlmProvider::Mock);
        assert_eq!(select_provider("mock", true, true), LlmProvider::Mock);
        assert_eq!(select_provider("claude", true, true), LlmProvider::Mock);
    }

    #[test]
    fn test_builtin_tools_registered() {
        let builder = AgentBuilder::new(AppConfig::default());
        let mut names = builder.build_tool_registry().tool_names();
        names.sort();
        assert_eq!(names, vec!["add_a_b", "fetch_url", "web_search"]);
    }

    #[test]
    fn test_system_prompt_defaults_and_file() {
        let builder = AgentBuilder::new(AppConfig::default());
        assert_eq!(builder.load_system_prompt().unwrap(), DEFAULT_SYSTEM_PROMPT);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "custom {{{{TOOLS_SPEC}}}}").unwrap();
        let mut cfg = AppConfig::default();
        cfg.agent.system_prompt_path = Some(file.path().to_path_buf());
        let builder = AgentBuilder::new(cfg);
        assert_eq!(builder.load_system_prompt().unwrap(), "custom {{TOOLS_SPEC}}");

        let mut cfg = AppConfig::default();
        cfg.agent.system_prompt_path = Some(PathBuf::from("/definitely/not/here.md"));
        let err = AgentBuilder::new(cfg).load_system_prompt().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[test]
    fn test_build_renders_tools_into_prompt() {
        let mut tools = ToolRegistry::new();
        tools.register(AddTool);
        let manager = AgentBuilder::new(AppConfig::default())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_tools(tools)
            .with_system_prompt("tools: {{TOOLS_SPEC}}")
            .build()
            .unwrap();
        let prompt = manager.planner().system_prompt();
        assert!(prompt.starts_with("tools: ["));
        assert!(prompt.contains("add_a_b"));
        assert!(!prompt.contains("web_search"));
        assert_eq!(manager.config().max_rounds, 6);
    }

    #[test]
    fn test_build_rejects_zero_rounds() {
        let mut cfg = AppConfig::default();
        cfg.agent.max_rounds = 0;
        let result = AgentBuilder::new(cfg).with_llm(Arc::new(MockLlmClient::new())).build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
