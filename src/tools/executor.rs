//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时；execute(tool_name, args) 在超时内调用 registry.execute，
//! 超时映射为 ToolError::Timeout；每次调用输出一条结构化审计日志（JSON）。
//! 重试不在这里做，由调度器通过 RetryExecutor 包裹。

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{ToolError, ToolRegistry, ToolSpec};

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(ToolError::Unknown(_))) => (false, "unknown_tool"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ToolError::Timeout(tool_name.to_string())),
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn tools_spec(&self) -> Vec<ToolSpec> {
        self.registry.tools_spec()
    }

    pub fn schema_json(&self) -> String {
        self.registry.to_schema_json()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
