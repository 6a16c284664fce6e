//! 规划层：Planner（提示词与模型调用）、推理轨迹、规划 / 重规划主循环

pub mod llm_planner;
pub mod loop_;
pub mod trace;

pub use loop_::{round_context, AgentManager, AgentManagerConfig, ReplanMode, DEFAULT_MAX_ROUNDS};
pub use llm_planner::{closing_prompt, round_prompt, Planner, DEFAULT_SYSTEM_PROMPT, TOOLS_SPEC_SLOT};
pub use trace::{ReasoningTrace, TraceEntry, TraceEvent};
