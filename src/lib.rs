//! Weaver - 自主多步问题求解器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 重试执行器、错误与恢复、运行状态、Agent 装配
//! - **graph**: 任务依赖图、计划增量合并、调度器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **plan**: 计划增量的线上格式与占位符解析
//! - **planner**: Planner、推理轨迹、规划 / 重规划主循环
//! - **tools**: 工具箱（add_a_b、web_search、fetch_url）与执行器

pub mod config;
pub mod core;
pub mod graph;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod planner;
pub mod tools;

pub use crate::core::{AgentBuilder, RunOutcome, RunState};
pub use crate::planner::{AgentManager, ReplanMode};
