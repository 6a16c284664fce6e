//! 计划层：模型输出的计划增量格式，以及任务参数中的占位符解析

pub mod increment;
pub mod placeholder;

pub use increment::{extract_json_str, parse_closing_reply, parse_increment, FinalAnswer, PlanIncrement, ProposedCall};
pub use placeholder::{referenced_nodes, resolve_placeholders, rewrite_node_ids, PlaceholderError, ResolveMode};
