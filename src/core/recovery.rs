//! 错误恢复引擎
//!
//! 根据一轮规划中的 AgentError 返回 RecoveryAction：格式或校验问题生成一段修正提示，
//! 作为下一轮上下文中的 planner_feedback 交给模型；模型调用本身失败则直接进入下一轮。

use crate::core::{AgentError, RecoveryAction};
use crate::graph::GraphError;

const PLAN_FORMAT_HINT: &str = "Reply with ONE JSON object of the form \
{\"thought\": \"...\", \"tool_calls\": [{\"id\": \"s1\", \"name\": \"<tool>\", \"args\": {...}, \"depends_on\": []}], \"final\": null}. \
No markdown, no extra text.";

#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonExtract(detail) | AgentError::PlanParse(detail) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply was not a valid plan ({detail}). {PLAN_FORMAT_HINT}"
            )),
            AgentError::InvalidPlan(GraphError::UnknownTool { name, .. }) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous plan used the tool '{name}', which does not exist. \
                 Use only the tools listed in the system prompt. The whole plan was discarded."
            )),
            AgentError::InvalidPlan(GraphError::UnknownDependency { id, dependency }) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Your previous plan was discarded: call '{id}' depends on '{dependency}', \
                     which is neither in the same reply nor in node_results."
                ))
            }
            AgentError::InvalidPlan(e) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous plan was discarded: {e}. Ids must be unique and dependencies must not form a cycle."
            )),
            AgentError::ClosingWithToolCalls(_) | AgentError::MissingFinal => {
                RecoveryAction::RetryWithPrompt(
                    "Only a final answer is allowed now: {\"final\": {\"answer\": \"...\"}}".to_string(),
                )
            }
            AgentError::Llm(_) | AgentError::Config(_) => RecoveryAction::SkipRound,
        }
    }
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::RetryWithPrompt(_) => "retry_with_prompt",
            RecoveryAction::SkipRound => "skip_round",
        }
    }

    pub fn hint(self) -> Option<String> {
        match self {
            RecoveryAction::RetryWithPrompt(hint) => Some(hint),
            RecoveryAction::SkipRound => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;

    #[test]
    fn test_recovery_json_errors_ask_for_valid_plan() {
        let engine = RecoveryEngine::new();
        for err in [
            AgentError::JsonExtract("No JSON object found in model output".into()),
            AgentError::PlanParse("missing field `tool_calls`".into()),
        ] {
            match engine.handle(&err) {
                RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("tool_calls")),
                other => panic!("Expected RetryWithPrompt, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_recovery_unknown_tool_names_it() {
        let engine = RecoveryEngine::new();
        let err = AgentError::InvalidPlan(GraphError::UnknownTool {
            id: "s1".into(),
            name: "fake_tool".into(),
        });
        let hint = engine.handle(&err).hint().unwrap();
        assert!(hint.contains("fake_tool"));
    }

    #[test]
    fn test_recovery_cycle() {
        let engine = RecoveryEngine::new();
        let err = AgentError::InvalidPlan(GraphError::Cycle(vec!["a".into(), "b".into()]));
        assert_eq!(engine.handle(&err).label(), "retry_with_prompt");
    }

    #[test]
    fn test_recovery_llm_error_skips_round() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Llm(LlmError::RateLimited { retry_after_ms: 1000 });
        assert_eq!(engine.handle(&err), RecoveryAction::SkipRound);
        assert_eq!(engine.handle(&err).hint(), None);
    }
}
