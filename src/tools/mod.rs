//! 工具层：Tool trait、注册表、带超时与审计日志的执行器，以及内置工具（add_a_b / web_search / fetch_url）

pub mod executor;
pub mod math;
pub mod registry;
pub mod web;

pub use executor::ToolExecutor;
pub use math::AddTool;
pub use registry::{parse_args, Tool, ToolError, ToolRegistry, ToolSpec};
pub use web::{FetchUrlTool, WebSearchTool};
