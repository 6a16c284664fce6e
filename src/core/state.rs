//! 运行状态：一次 AgentManager::run 独占的任务图、最终答案、轮次与推理轨迹
//!
//! 整个值随循环显式传递，结束后原样交给调用方（可直接序列化为 JSON）。

use serde::Serialize;

use crate::graph::TaskGraph;
use crate::plan::FinalAnswer;
use crate::planner::trace::{ReasoningTrace, TraceEvent};

/// 运行结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// 得到最终答案
    Answered,
    /// 没有待执行任务且收尾请求也没有得到答案
    Stalled,
    /// 轮数用尽
    BudgetExhausted,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub nodes: TaskGraph,
    #[serde(rename = "final")]
    pub final_answer: Option<FinalAnswer>,
    /// 当前轮次（从 0 开始，只增不减）
    pub step: usize,
    pub outcome: Option<RunOutcome>,
    pub trace: ReasoningTrace,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self) -> Option<&str> {
        self.final_answer.as_ref().map(|f| f.answer.as_str())
    }

    pub fn is_answered(&self) -> bool {
        self.outcome == Some(RunOutcome::Answered)
    }

    /// 以当前轮次记录事件
    pub fn record(&mut self, event: TraceEvent) -> &TraceEvent {
        &self.trace.record(self.step, event).event
    }
}
