//! 调度器：就绪计算、失败传播、执行与不动点
//!
//! 一趟（pass）：
//! 1. 依赖中有 Error 的 Pending 任务直接转为 Error（dependency failed），不会执行；
//! 2. 计算就绪集：Pending 且所有依赖均为 Done；
//! 3. 以全部 Done 任务的结果为环境解析参数中的占位符，标记 Running，经 RetryExecutor 调用工具；
//!    同一就绪集内的任务相互独立，并发执行，并发数由 Semaphore 限制；
//! 4. 重复直到某一趟没有任何状态变化（不动点）。此时仍为 Pending 的任务依赖无法满足（环或缺失依赖），
//!    作为 unsatisfiable 上报，不会被丢弃。
//!
//! 按任务粒度重新规划时，循环直接使用 prepare_ready / execute / apply 三个原语。

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::core::retry::{RetryExecutor, RetryPolicy};
use crate::graph::types::{TaskId, TaskStatus};
use crate::graph::TaskGraph;
use crate::plan::{resolve_placeholders, ResolveMode};
use crate::tools::{ToolError, ToolExecutor};

pub const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 3;

/// 已解析参数、已标记 Running、等待执行的调用
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub id: TaskId,
    pub tool: String,
    pub args: Value,
}

/// 一次调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: TaskId,
    pub outcome: Result<Value, ToolError>,
}

/// prepare_ready 的结果
#[derive(Debug, Default)]
pub struct Prepared {
    pub calls: Vec<PreparedCall>,
    /// 依赖失败或占位符无法解析而直接转为 Error 的任务
    pub failed: Vec<TaskId>,
}

/// 运行到不动点的汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerReport {
    pub passes: usize,
    pub executed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub unsatisfiable: Vec<TaskId>,
}

pub struct Scheduler {
    tools: Arc<ToolExecutor>,
    retry: RetryExecutor,
    policy: RetryPolicy,
    limiter: Arc<Semaphore>,
    mode: ResolveMode,
}

impl Scheduler {
    pub fn new(tools: Arc<ToolExecutor>, retry: RetryExecutor, policy: RetryPolicy) -> Self {
        Self {
            tools,
            retry,
            policy,
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_TOOLS)),
            mode: ResolveMode::default(),
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn with_resolve_mode(mut self, mode: ResolveMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn tools(&self) -> &Arc<ToolExecutor> {
        &self.tools
    }

    /// 依赖中有 Error 的 Pending 任务转为 Error；返回本次转换的任务
    pub fn propagate_failures(&self, graph: &mut TaskGraph) -> Vec<TaskId> {
        let mut failed = Vec::new();
        // 按插入顺序一次扫描可覆盖大部分传递链，其余由后续 pass 完成
        for id in graph.failed_dependency_ids() {
            let failed_deps: Vec<TaskId> = graph
                .get(&id)
                .map(|task| {
                    task.depends_on
                        .iter()
                        .filter(|d| graph.get(d).is_some_and(|t| t.status == TaskStatus::Error))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            if let Some(task) = graph.get_mut(&id) {
                if task.fail(format!("dependency failed: {}", failed_deps.join(", "))) {
                    tracing::debug!(task = %id, deps = ?failed_deps, "dependency failed, task skipped");
                    failed.push(id);
                }
            }
        }
        failed
    }

    /// 传播依赖失败，然后解析就绪任务的参数并标记 Running
    pub fn prepare_ready(&self, graph: &mut TaskGraph) -> Prepared {
        let mut prepared = Prepared {
            failed: self.propagate_failures(graph),
            ..Prepared::default()
        };

        let ready = graph.ready_ids();
        if ready.is_empty() {
            return prepared;
        }
        let env = graph.done_results();

        for id in ready {
            let Some(task) = graph.get_mut(&id) else { continue };
            match resolve_placeholders(&Value::Object(task.args.clone()), &env, self.mode) {
                Ok(args) => {
                    task.mark_running();
                    prepared.calls.push(PreparedCall {
                        id,
                        tool: task.name.clone(),
                        args,
                    });
                }
                Err(e) => {
                    tracing::warn!(task = %id, error = %e, "placeholder resolution failed");
                    task.fail(format!("placeholder resolution failed: {e}"));
                    prepared.failed.push(id);
                }
            }
        }
        prepared
    }

    /// 在并发限制与重试策略下执行一次调用
    pub async fn execute(&self, call: PreparedCall) -> Completion {
        // Semaphore 从不关闭，acquire 只会成功
        let _permit = self.limiter.acquire().await.ok();
        let label = format!("tool:{}", call.tool);
        let outcome = self
            .retry
            .run(&self.policy, &label, || self.tools.execute(&call.tool, call.args.clone()))
            .await;
        Completion {
            id: call.id,
            outcome,
        }
    }

    /// 写回结果：Running -> Done / Error；返回是否发生状态变化
    pub fn apply(&self, graph: &mut TaskGraph, completion: Completion) -> bool {
        let Some(task) = graph.get_mut(&completion.id) else {
            tracing::warn!(task = %completion.id, "completion for unknown task ignored");
            return false;
        };
        match completion.outcome {
            Ok(result) => task.complete(result),
            Err(e) => {
                tracing::warn!(task = %completion.id, tool = %task.name, error = %e, "task failed");
                task.fail(e.to_string())
            }
        }
    }

    /// 一趟：传播失败、执行当前就绪集；返回（是否有变化, 执行过的任务, 直接失败的任务）
    pub async fn run_pass(&self, graph: &mut TaskGraph) -> (bool, Vec<TaskId>, Vec<TaskId>) {
        let prepared = self.prepare_ready(graph);
        let executed: Vec<TaskId> = prepared.calls.iter().map(|c| c.id.clone()).collect();

        let completions = join_all(prepared.calls.into_iter().map(|call| self.execute(call))).await;
        for completion in completions {
            self.apply(graph, completion);
        }

        let changed = !executed.is_empty() || !prepared.failed.is_empty();
        (changed, executed, prepared.failed)
    }

    /// 重复执行直到不动点
    pub async fn run_to_fixed_point(&self, graph: &mut TaskGraph) -> SchedulerReport {
        let mut report = SchedulerReport::default();
        loop {
            let (changed, executed, failed) = self.run_pass(graph).await;
            report.passes += 1;
            report.executed.extend(executed);
            report.failed.extend(failed);
            if !changed {
                break;
            }
        }

        report.unsatisfiable = graph.pending_ids();
        if !report.unsatisfiable.is_empty() {
            tracing::warn!(tasks = ?report.unsatisfiable, "tasks left pending at fixed point, dependencies cannot be satisfied");
        }
        report
    }
}
