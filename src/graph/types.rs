//! 任务图类型定义
//!
//! 定义任务节点、任务状态、状态统计与合并校验错误

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type TaskId = String;

/// 任务状态：Pending -> Running -> {Done, Error}；Done / Error 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待依赖满足
    Pending,
    /// 正在执行
    Running,
    /// 已完成，result 可被其它任务引用
    Done,
    /// 失败（工具失败、占位符无法解析或依赖失败）
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }
}

/// 任务图中的节点：一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 任务ID（运行期内唯一且稳定）
    pub id: TaskId,
    /// 工具名称
    pub name: String,
    /// 原始参数，可能含未解析的占位符
    pub args: Map<String, Value>,
    /// 依赖的任务ID
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        args: Map<String, Value>,
        depends_on: Vec<TaskId>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            depends_on,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Pending -> Running；其它状态下返回 false 且不变
    pub fn mark_running(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        true
    }

    /// Running -> Done
    pub fn complete(&mut self, result: Value) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Done;
        self.result = Some(result);
        true
    }

    /// Pending / Running -> Error；终态不再变化
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Error;
        self.error = Some(error.into());
        true
    }
}

/// 各状态的任务数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
}

/// 计划增量校验失败：整个增量被拒绝，任务图不变
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Tool call has an empty id")]
    EmptyId,

    #[error("Duplicate id '{0}' in plan increment")]
    DuplicateId(TaskId),

    #[error("Unknown tool '{name}' in plan (call '{id}')")]
    UnknownTool { id: TaskId, name: String },

    #[error("Task '{0}' depends on itself")]
    SelfDependency(TaskId),

    #[error("Task '{id}' depends on unknown task '{dependency}'")]
    UnknownDependency { id: TaskId, dependency: TaskId },

    #[error("Dependency cycle among tasks: {}", .0.join(", "))]
    Cycle(Vec<TaskId>),
}
