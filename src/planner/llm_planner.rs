//! Planner：组装提示词并调用模型，得到计划增量或收尾答案
//!
//! system prompt 模板中的 {{TOOLS_SPEC}} 在构造时替换为工具列表 JSON；
//! 每轮 prompt 为「原始请求 + Context (JSON)」，模型调用经 RetryExecutor 按模型调用策略重试。

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::retry::{RetryExecutor, RetryPolicy};
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::plan::{parse_closing_reply, parse_increment, FinalAnswer, PlanIncrement};

/// 内置 system prompt 模板
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../../config/prompts/system.md");

/// 模板中工具列表的占位
pub const TOOLS_SPEC_SLOT: &str = "{{TOOLS_SPEC}}";

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    retry: RetryExecutor,
    policy: RetryPolicy,
}

impl Planner {
    /// template 中的 {{TOOLS_SPEC}} 替换为 tools_spec_json
    pub fn new(
        llm: Arc<dyn LlmClient>,
        template: &str,
        tools_spec_json: &str,
        retry: RetryExecutor,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            system_prompt: template.replace(TOOLS_SPEC_SLOT, tools_spec_json),
            retry,
            policy,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    async fn generate(&self, label: &str, prompt: &str) -> Result<String, AgentError> {
        let raw = self
            .retry
            .run(&self.policy, label, || self.llm.generate(prompt, Some(self.system_prompt.as_str())))
            .await?;
        tracing::debug!(op = label, chars = raw.len(), "model reply received");
        Ok(raw)
    }

    /// 请求一轮计划增量
    pub async fn plan(&self, query: &str, context: &Map<String, Value>) -> Result<PlanIncrement, AgentError> {
        let raw = self.generate("llm:plan", &round_prompt(query, context)).await?;
        parse_increment(&raw)
    }

    /// 收尾请求：只根据已有工具结果给出最终答案，不允许再提出工具调用
    pub async fn finalize(&self, query: &str, results: &Map<String, Value>) -> Result<FinalAnswer, AgentError> {
        let raw = self.generate("llm:finalize", &closing_prompt(query, results)).await?;
        parse_closing_reply(&raw)
    }
}

/// `<请求>\n\nContext (JSON):\n<上下文>`
pub fn round_prompt(query: &str, context: &Map<String, Value>) -> String {
    let json = serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string());
    format!("{query}\n\nContext (JSON):\n{json}")
}

pub fn closing_prompt(query: &str, results: &Map<String, Value>) -> String {
    let json = serde_json::to_string(results).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{query}\n\n\
         You planned and executed tools. \
         Based on the following tool results (JSON), return ONLY a JSON object of the form:\n\
         {{\"final\": {{\"answer\": \"...\"}}}}\n\
         No tool calls, no markdown.\n\n\
         {json}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use serde_json::json;

    fn planner(mock: Arc<MockLlmClient>) -> Planner {
        Planner::new(
            mock,
            "tools: {{TOOLS_SPEC}}",
            r#"[{"name":"add_a_b"}]"#,
            RetryExecutor::new(),
            RetryPolicy::no_retry(),
        )
    }

    #[test]
    fn test_default_template_has_tools_slot() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains(TOOLS_SPEC_SLOT));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("${node:"));
    }

    #[test]
    fn test_round_prompt_layout() {
        let mut ctx = Map::new();
        ctx.insert("node_results".into(), json!({"s1": {"sum": 5}}));
        assert_eq!(
            round_prompt("compute 2+3", &ctx),
            "compute 2+3\n\nContext (JSON):\n{\"node_results\":{\"s1\":{\"sum\":5}}}"
        );
    }

    #[tokio::test]
    async fn test_plan_sends_rendered_system_prompt() {
        let mock = Arc::new(MockLlmClient::scripted([r#"{"tool_calls":[]}"#]));
        let p = planner(mock.clone());
        let inc = p.plan("hi", &Map::new()).await.unwrap();
        assert!(inc.tool_calls.is_empty());

        let calls = mock.prompts();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].system.as_deref(), Some(r#"tools: [{"name":"add_a_b"}]"#));
        assert!(calls[0].prompt.starts_with("hi\n\nContext (JSON):"));
    }

    #[tokio::test]
    async fn test_model_failure_surfaces_as_llm_error() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error(LlmError::InvalidRequest("bad key".into()));
        let err = planner(mock).plan("hi", &Map::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(LlmError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_finalize_parses_answer() {
        let mock = Arc::new(MockLlmClient::scripted([r#"```json
{"final": {"answer": "42"}}
```"#]));
        let p = planner(mock.clone());
        let mut results = Map::new();
        results.insert("s1".into(), json!({"sum": 42}));
        let answer = p.finalize("what is it", &results).await.unwrap();
        assert_eq!(answer.answer, "42");
        assert!(mock.prompts()[0].prompt.contains(r#"{"s1":{"sum":42}}"#));
    }
}
