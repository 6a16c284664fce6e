//! 推理轨迹：规划与执行过程中的有序事件
//!
//! 每条记录带序号、轮次与时间戳；事件可序列化为 JSON（`event` 字段为事件类型），
//! 也可通过 mpsc 通道实时推送给调用方。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::graph::{StatusCounts, TaskId};

/// 轨迹事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// 本轮计划无法提取、解析或校验；图保持不变
    PlanningError {
        error: String,
        /// 恢复动作（retry_with_prompt / skip_round）
        recovery: String,
    },
    /// 计划增量已并入任务图
    Merged {
        #[serde(skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
        added: Vec<TaskId>,
        remapped: Vec<(TaskId, TaskId)>,
        /// 按任务粒度重新规划时，触发本次规划的已完成任务
        #[serde(skip_serializing_if = "Option::is_none")]
        after_task: Option<TaskId>,
    },
    /// 模型给出最终答案，但仍有任务未结束，答案被忽略
    FinalDeferred { answer: String, outstanding: usize },
    /// 模型在规划回复中给出最终答案，且所有任务均已结束
    FinalFromLlm { answer: String },
    /// 本轮调度结束后的状态统计
    Executed {
        counts: StatusCounts,
        node_status: Map<String, Value>,
    },
    /// 不动点时仍为 Pending 的任务（依赖无法满足）
    Unsatisfiable { tasks: Vec<TaskId> },
    /// 收尾请求得到的最终答案
    Finalized { answer: String },
    /// 没有待执行任务也没有最终答案，运行停止
    Stalled { reason: String },
    /// 轮数用尽仍没有最终答案
    BudgetExhausted { max_rounds: usize },
    /// 所有 Error 任务汇总：{id: {tool, args, error}}
    SummaryErrors { errors: Map<String, Value> },
}

impl TraceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::PlanningError { .. } => "planning_error",
            TraceEvent::Merged { .. } => "merged",
            TraceEvent::FinalDeferred { .. } => "final_deferred",
            TraceEvent::FinalFromLlm { .. } => "final_from_llm",
            TraceEvent::Executed { .. } => "executed",
            TraceEvent::Unsatisfiable { .. } => "unsatisfiable",
            TraceEvent::Finalized { .. } => "finalized",
            TraceEvent::Stalled { .. } => "stalled",
            TraceEvent::BudgetExhausted { .. } => "budget_exhausted",
            TraceEvent::SummaryErrors { .. } => "summary_errors",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    pub seq: usize,
    pub step: usize,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TraceEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReasoningTrace {
    entries: Vec<TraceEntry>,
}

impl ReasoningTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: usize, event: TraceEvent) -> &TraceEntry {
        let seq = self.entries.len();
        self.entries.push(TraceEntry {
            seq,
            step,
            at: Utc::now(),
            event,
        });
        &self.entries[seq]
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn events(&self) -> impl DoubleEndedIterator<Item = &TraceEvent> {
        self.entries.iter().map(|e| &e.event)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().filter(|e| e.kind() == kind).count()
    }

    pub fn last(&self) -> Option<&TraceEvent> {
        self.entries.last().map(|e| &e.event)
    }

    /// 最后一次 final_from_llm / finalized 事件中的答案
    pub fn final_answer(&self) -> Option<&str> {
        self.events().rev().find_map(|e| match e {
            TraceEvent::FinalFromLlm { answer } | TraceEvent::Finalized { answer } => Some(answer.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_assigns_sequence() {
        let mut trace = ReasoningTrace::new();
        trace.record(0, TraceEvent::Stalled { reason: "x".into() });
        let entry = trace.record(1, TraceEvent::BudgetExhausted { max_rounds: 2 });
        assert_eq!(entry.seq, 1);
        assert_eq!(entry.step, 1);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.count("stalled"), 1);
    }

    #[test]
    fn test_final_answer_prefers_latest() {
        let mut trace = ReasoningTrace::new();
        assert_eq!(trace.final_answer(), None);
        trace.record(0, TraceEvent::FinalDeferred { answer: "early".into(), outstanding: 1 });
        assert_eq!(trace.final_answer(), None);
        trace.record(1, TraceEvent::FinalFromLlm { answer: "a".into() });
        trace.record(2, TraceEvent::Finalized { answer: "b".into() });
        assert_eq!(trace.final_answer(), Some("b"));
    }

    #[test]
    fn test_entry_serialization_is_flat() {
        let mut trace = ReasoningTrace::new();
        trace.record(3, TraceEvent::FinalFromLlm { answer: "5".into() });
        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value[0]["event"], "final_from_llm");
        assert_eq!(value[0]["answer"], "5");
        assert_eq!(value[0]["step"], 3);
        assert!(value[0]["at"].is_string());
    }
}
