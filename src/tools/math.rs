//! add_a_b 工具：两个整数求和（用于联调规划与占位符链路）

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::tools::{parse_args, Tool, ToolError};

/// 参数：整数，或可解析为整数的字符串（文本占位符替换后的结果是字符串）
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddArgs {
    #[serde(deserialize_with = "lenient_i64")]
    pub a: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub b: i64,
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// 由参数结构体生成 JSON Schema（schemars），供 tools_spec 使用
pub(crate) fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

pub struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add_a_b"
    }

    fn description(&self) -> &str {
        "Add two integers and return their sum. Result: {\"sum\": a + b}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<AddArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: AddArgs = parse_args(self.name(), args)?;
        let sum = args.a.checked_add(args.b).ok_or_else(|| ToolError::InvalidArgs {
            tool: self.name().to_string(),
            reason: "integer overflow".to_string(),
        })?;
        Ok(serde_json::json!({ "sum": sum }))
    }
}
