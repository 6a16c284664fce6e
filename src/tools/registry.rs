//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 注册表同时是「可用工具集」的唯一来源：tools_spec() 用于计划校验，to_schema_json() 注入 system prompt。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::retry::{Classify, FailureKind};

/// 工具调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    Unknown(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: String, reason: String },

    #[error("Tool timeout: {0}")]
    Timeout(String),

    #[error("Tool execution failed: {0}")]
    Failed(String),
}

impl Classify for ToolError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            ToolError::Unknown(_) => FailureKind::Permanent,
            ToolError::InvalidArgs { .. } => FailureKind::InvalidInput,
            ToolError::Timeout(_) => FailureKind::Timeout,
            ToolError::Failed(_) => FailureKind::Transient,
        }
    }
}

/// 将 JSON 参数反序列化为工具的参数结构体
pub fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 与结果均为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划中 tool_calls[].name 必须与之一致）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// 对外公布的工具描述：{name, description, schema}
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// 工具注册表：按名称有序存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn tools_spec(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                schema: tool.parameters_schema(),
            })
            .collect()
    }

    /// 工具列表的 JSON（填入 system prompt 的 {{TOOLS_SPEC}}）
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.tools_spec()).unwrap_or_else(|_| "[]".to_string())
    }
}
