//! Agent 错误类型与恢复动作
//!
//! AgentError 只描述「一轮」内的失败（计划提取/解析/校验、模型调用），从不终止整个运行；
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / SkipRound。
//! 工具与占位符失败记录在具体任务上（Task.error），不经过这里。

use thiserror::Error;

use crate::graph::GraphError;
use crate::llm::LlmError;

/// 一轮规划中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 模型输出中找不到可解析的 JSON 对象
    #[error("JSON extract error: {0}")]
    JsonExtract(String),

    /// JSON 合法但不符合计划格式（缺字段、未知字段、类型错误）
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] GraphError),

    /// 收尾请求中模型仍然提出了工具调用
    #[error("Closing reply proposed {0} tool call(s); only a final answer is allowed")]
    ClosingWithToolCalls(usize),

    #[error("Closing reply has no final answer")]
    MissingFinal,

    /// 重试耗尽后的模型调用失败
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Config error: {0}")]
    Config(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将提示注入下一轮上下文（planner_feedback），让模型修正输出
    RetryWithPrompt(String),
    /// 不附加提示，直接进入下一轮
    SkipRound,
}
