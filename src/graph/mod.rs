//! 任务图：节点与状态、计划增量的校验与合并、依赖就绪调度

pub mod scheduler;
pub mod task_graph;
pub mod types;

pub use task_graph::{MergeReport, TaskGraph};
pub use scheduler::{Completion, PreparedCall, Prepared, Scheduler, SchedulerReport, DEFAULT_MAX_CONCURRENT_TOOLS};
pub use types::{GraphError, StatusCounts, Task, TaskId, TaskStatus};
