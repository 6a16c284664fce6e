//! 规划 / 重规划主循环
//!
//! 每轮：构造上下文（node_results + 调用方附加上下文 + 上一轮的 planner_feedback）-> 请求计划增量
//! -> 校验并合并 -> 若带最终答案且所有任务已结束则结束 -> 否则调度到不动点 -> 记录状态统计
//! -> 若没有待执行任务且模型没有给出答案，发起一次只允许回答的收尾请求，失败则判定停滞。
//! 轮数用尽仍无答案记为 budget_exhausted。任何一轮的规划错误只中止该轮，不会终止运行；
//! 每一轮（包括规划失败或直接给出答案的轮次）都记录一条状态统计。
//!
//! 重规划粒度两种：per_round 只在轮次边界重新规划；per_task 每完成一个任务就追加一次子轮规划，
//! 子轮规划期间其余工具照常运行。

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::state::{RunOutcome, RunState};
use crate::core::{AgentError, RecoveryEngine};
use crate::graph::{Completion, MergeReport, Scheduler, TaskGraph, TaskId};
use crate::plan::{FinalAnswer, PlanIncrement};
use crate::planner::llm_planner::Planner;
use crate::planner::trace::TraceEvent;

/// 默认最大轮数，防止无限规划
pub const DEFAULT_MAX_ROUNDS: usize = 6;

/// 重规划粒度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanMode {
    #[default]
    PerRound,
    PerTask,
}

impl FromStr for ReplanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_round" => Ok(ReplanMode::PerRound),
            "per_task" => Ok(ReplanMode::PerTask),
            other => Err(format!("unknown replan mode '{other}' (expected per-round or per-task)")),
        }
    }
}

impl fmt::Display for ReplanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplanMode::PerRound => write!(f, "per_round"),
            ReplanMode::PerTask => write!(f, "per_task"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentManagerConfig {
    pub max_rounds: usize,
    pub replan_mode: ReplanMode,
}

impl Default for AgentManagerConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            replan_mode: ReplanMode::default(),
        }
    }
}

pub struct AgentManager {
    planner: Planner,
    scheduler: Scheduler,
    recovery: RecoveryEngine,
    config: AgentManagerConfig,
    event_tx: Option<UnboundedSender<TraceEvent>>,
}

/// 一轮之内的可变上下文
struct RoundCtx<'a> {
    query: &'a str,
    side: &'a Map<String, Value>,
    feedback: Option<String>,
    /// 本轮出现过被推迟的最终答案（此时不发起收尾请求，交给下一轮）
    final_deferred: bool,
}

impl AgentManager {
    pub fn new(planner: Planner, scheduler: Scheduler, config: AgentManagerConfig) -> Self {
        Self {
            planner,
            scheduler,
            recovery: RecoveryEngine::new(),
            config,
            event_tx: None,
        }
    }

    /// 实时推送轨迹事件
    pub fn with_event_tx(mut self, tx: UnboundedSender<TraceEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AgentManagerConfig {
        &self.config
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// 运行一次请求；initial_context 为调用方附加的上下文，每轮随 node_results 一起交给模型
    pub async fn run(&self, query: &str, initial_context: Option<Map<String, Value>>) -> RunState {
        let side = initial_context.unwrap_or_default();
        let mut state = RunState::new();
        let mut feedback: Option<String> = None;
        let max_rounds = self.config.max_rounds;

        for step in 0..max_rounds {
            state.step = step;
            tracing::info!(step, max_rounds, mode = %self.config.replan_mode, "round started");

            let mut ctx = RoundCtx {
                query,
                side: &side,
                feedback: feedback.take(),
                final_deferred: false,
            };

            let Some(increment) = self.plan_and_merge(&mut state, &mut ctx, None).await else {
                self.record_round_status(&mut state);
                feedback = ctx.feedback.take();
                continue;
            };

            if let Some(answer) = increment.final_answer {
                if state.nodes.all_terminal() {
                    self.accept_final(&mut state, answer, false);
                    self.record_round_status(&mut state);
                    break;
                }
                self.defer_final(&mut state, &mut ctx, answer);
            }

            let answered = match self.config.replan_mode {
                ReplanMode::PerRound => {
                    let report = self.scheduler.run_to_fixed_point(&mut state.nodes).await;
                    if !report.unsatisfiable.is_empty() {
                        self.emit(&mut state, TraceEvent::Unsatisfiable { tasks: report.unsatisfiable });
                    }
                    false
                }
                ReplanMode::PerTask => self.run_per_task(&mut state, &mut ctx).await,
            };

            self.record_round_status(&mut state);

            if answered {
                break;
            }

            if !state.nodes.has_pending() && !ctx.final_deferred {
                match self.planner.finalize(query, &state.nodes.node_results()).await {
                    Ok(answer) => {
                        self.accept_final(&mut state, answer, true);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(step, error = %e, "closing request produced no final answer, run stalled");
                        self.emit(&mut state, TraceEvent::Stalled { reason: e.to_string() });
                        state.outcome = Some(RunOutcome::Stalled);
                        break;
                    }
                }
            }

            feedback = ctx.feedback.take();
        }

        if state.outcome.is_none() {
            tracing::warn!(max_rounds, "round budget exhausted without a final answer");
            self.emit(&mut state, TraceEvent::BudgetExhausted { max_rounds });
            state.outcome = Some(RunOutcome::BudgetExhausted);
        }

        let errors = state.nodes.error_summary();
        if !errors.is_empty() {
            self.emit(&mut state, TraceEvent::SummaryErrors { errors });
        }

        state
    }

    /// 按任务粒度调度：每完成一个任务就追加一次子轮规划；返回是否已得到最终答案
    ///
    /// 规划请求进行期间继续推进运行中的工具，期间完成的结果先缓存，规划结束后依次写回。
    async fn run_per_task(&self, state: &mut RunState, ctx: &mut RoundCtx<'_>) -> bool {
        let mut in_flight = FuturesUnordered::new();
        let mut finished: VecDeque<Completion> = VecDeque::new();
        for call in self.scheduler.prepare_ready(&mut state.nodes).calls {
            in_flight.push(self.scheduler.execute(call));
        }

        loop {
            let completion = match finished.pop_front() {
                Some(completion) => completion,
                None => match in_flight.next().await {
                    Some(completion) => completion,
                    None => {
                        // 没有运行中的任务：失败传播可能产生新的变化，再尝试一次
                        let prepared = self.scheduler.prepare_ready(&mut state.nodes);
                        if prepared.calls.is_empty() && prepared.failed.is_empty() {
                            break;
                        }
                        for call in prepared.calls {
                            in_flight.push(self.scheduler.execute(call));
                        }
                        continue;
                    }
                },
            };

            let task: TaskId = completion.id.clone();
            self.scheduler.apply(&mut state.nodes, completion);

            let planning = self.plan_and_merge(state, ctx, Some(task));
            if let Some(increment) = drive_alongside(planning, &mut in_flight, &mut finished).await {
                if let Some(answer) = increment.final_answer {
                    if in_flight.is_empty() && finished.is_empty() && state.nodes.all_terminal() {
                        self.accept_final(state, answer, false);
                        return true;
                    }
                    self.defer_final(state, ctx, answer);
                }
            }

            for call in self.scheduler.prepare_ready(&mut state.nodes).calls {
                in_flight.push(self.scheduler.execute(call));
            }
        }

        let unsatisfiable = state.nodes.pending_ids();
        if !unsatisfiable.is_empty() {
            tracing::warn!(tasks = ?unsatisfiable, "tasks left pending, dependencies cannot be satisfied");
            self.emit(state, TraceEvent::Unsatisfiable { tasks: unsatisfiable });
        }
        false
    }

    /// 请求计划增量并合并；失败时记录规划错误、把恢复提示放进 ctx.feedback 并返回 None
    async fn plan_and_merge(
        &self,
        state: &mut RunState,
        ctx: &mut RoundCtx<'_>,
        after_task: Option<TaskId>,
    ) -> Option<PlanIncrement> {
        let context = round_context(&state.nodes, ctx.side, ctx.feedback.take());
        match self.next_increment(ctx.query, &context, &mut state.nodes).await {
            Ok((increment, report)) => {
                tracing::debug!(step = state.step, added = ?report.added, "plan merged");
                self.emit(
                    state,
                    TraceEvent::Merged {
                        thought: increment.thought.clone(),
                        added: report.added,
                        remapped: report.remapped,
                        after_task,
                    },
                );
                Some(increment)
            }
            Err(e) => {
                let action = self.recovery.handle(&e);
                tracing::warn!(step = state.step, error = %e, recovery = action.label(), "planning error, round aborted");
                self.emit(
                    state,
                    TraceEvent::PlanningError {
                        error: e.to_string(),
                        recovery: action.label().to_string(),
                    },
                );
                ctx.feedback = action.hint();
                None
            }
        }
    }

    async fn next_increment(
        &self,
        query: &str,
        context: &Map<String, Value>,
        graph: &mut TaskGraph,
    ) -> Result<(PlanIncrement, MergeReport), AgentError> {
        let increment = self.planner.plan(query, context).await?;
        let tools = self.scheduler.tools();
        let report = graph.merge(&increment, |name| tools.has_tool(name))?;
        Ok((increment, report))
    }

    fn accept_final(&self, state: &mut RunState, answer: FinalAnswer, closing: bool) {
        tracing::info!(step = state.step, answer = %answer.answer, "final answer");
        let event = if closing {
            TraceEvent::Finalized { answer: answer.answer.clone() }
        } else {
            TraceEvent::FinalFromLlm { answer: answer.answer.clone() }
        };
        self.emit(state, event);
        state.final_answer = Some(answer);
        state.outcome = Some(RunOutcome::Answered);
    }

    fn defer_final(&self, state: &mut RunState, ctx: &mut RoundCtx<'_>, answer: FinalAnswer) {
        let counts = state.nodes.status_counts();
        let outstanding = counts.pending + counts.running;
        tracing::warn!(step = state.step, outstanding, "final answer proposed while tasks are outstanding, ignored");
        ctx.final_deferred = true;
        self.emit(
            state,
            TraceEvent::FinalDeferred {
                answer: answer.answer,
                outstanding,
            },
        );
    }

    /// 每轮一条状态统计（包括规划失败与直接给出答案的轮次）
    fn record_round_status(&self, state: &mut RunState) {
        let counts = state.nodes.status_counts();
        tracing::info!(
            step = state.step,
            pending = counts.pending,
            done = counts.done,
            error = counts.error,
            "round executed"
        );
        let node_status = state.nodes.node_status();
        self.emit(state, TraceEvent::Executed { counts, node_status });
    }

    fn emit(&self, state: &mut RunState, event: TraceEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event.clone());
        }
        state.record(event);
    }
}

/// 等待 `fut` 完成，同时继续推进运行中的工具调用；期间完成的调用追加到 `finished`
async fn drive_alongside<T, F>(
    fut: impl Future<Output = T>,
    in_flight: &mut FuturesUnordered<F>,
    finished: &mut VecDeque<Completion>,
) -> T
where
    F: Future<Output = Completion>,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            Some(completion) = in_flight.next(), if !in_flight.is_empty() => finished.push_back(completion),
        }
    }
}

/// 每轮交给模型的上下文：调用方附加上下文 + node_results（同名时以 node_results 为准）+ planner_feedback
pub fn round_context(graph: &TaskGraph, side: &Map<String, Value>, feedback: Option<String>) -> Map<String, Value> {
    let mut context = side.clone();
    context.insert("node_results".to_string(), Value::Object(graph.node_results()));
    if let Some(hint) = feedback {
        context.insert("planner_feedback".to_string(), Value::String(hint));
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Task;
    use serde_json::json;

    #[test]
    fn test_replan_mode_parsing() {
        assert_eq!("per-round".parse::<ReplanMode>().unwrap(), ReplanMode::PerRound);
        assert_eq!("PER_TASK".parse::<ReplanMode>().unwrap(), ReplanMode::PerTask);
        assert!("sometimes".parse::<ReplanMode>().is_err());
        assert_eq!(ReplanMode::PerTask.to_string(), "per_task");
    }

    #[test]
    fn test_round_context_layout() {
        let mut graph = TaskGraph::new();
        graph.insert(Task::new("s1", "add_a_b", Map::new(), vec![]));
        let task = graph.get_mut("s1").unwrap();
        task.mark_running();
        task.complete(json!({"sum": 5}));

        let mut side = Map::new();
        side.insert("user".into(), json!("alice"));
        side.insert("node_results".into(), json!("spoofed"));

        let ctx = round_context(&graph, &side, Some("fix it".into()));
        assert_eq!(ctx["node_results"], json!({"s1": {"sum": 5}}));
        assert_eq!(ctx["user"], "alice");
        assert_eq!(ctx["planner_feedback"], "fix it");

        let ctx = round_context(&graph, &Map::new(), None);
        assert!(ctx.get("planner_feedback").is_none());
    }
}
