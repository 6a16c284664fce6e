//! 计划增量：模型每轮输出的 JSON 格式与解析
//!
//! 格式：`{"thought"?: str, "tool_calls": [{"id", "name", "args", "depends_on"?}], "final"?: {"answer"} | null}`。
//! 模型输出可能带 Markdown 代码块或前后说明文字，先由 extract_json_str 提取出 JSON 对象再解析；
//! 缺少必需字段或出现未知字段都会被拒绝，不会进入合并。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;

/// 模型提出的一次工具调用；id 为计划内标识，合并时可能被重新分配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProposedCall {
    pub id: String,
    pub name: String,
    pub args: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// 最终答案；answer 若不是字符串则取其 JSON 文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalAnswer {
    #[serde(deserialize_with = "answer_text")]
    pub answer: String,
}

impl FinalAnswer {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }
}

fn answer_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanIncrement {
    #[serde(default)]
    pub thought: Option<String>,
    pub tool_calls: Vec<ProposedCall>,
    #[serde(default, rename = "final")]
    pub final_answer: Option<FinalAnswer>,
}

/// 收尾请求的回复：只允许 final，tool_calls 必须为空
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClosingReply {
    #[serde(default, rename = "final")]
    final_answer: Option<FinalAnswer>,
    #[serde(default)]
    tool_calls: Vec<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    thought: Option<String>,
}

fn fence_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^```[a-zA-Z]*\s*").expect("valid fence regex"))
}

fn fence_close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*```$").expect("valid fence regex"))
}

/// 从模型输出中提取 JSON 文本
///
/// 1. 去掉首尾空白与首尾的 ``` 代码块标记；
/// 2. 剩余部分能整体解析为 JSON 则直接返回；
/// 3. 否则取第一个 `{` 开始的那个完整 JSON 值（括号配平，字符串内的括号不计），能解析则返回，不能则报错。
pub fn extract_json_str(text: &str) -> Result<&str, AgentError> {
    let mut s = text.trim();
    if s.starts_with("```") {
        if let Some(m) = fence_open_re().find(s) {
            s = &s[m.end()..];
        }
        if let Some(m) = fence_close_re().find(s) {
            s = &s[..m.start()];
        }
        s = s.trim();
    }

    if serde_json::from_str::<Value>(s).is_ok() {
        return Ok(s);
    }

    let Some(start) = s.find('{') else {
        return Err(AgentError::JsonExtract(
            "No JSON object found in model output".to_string(),
        ));
    };
    // 从第一个 `{` 起只读取一个完整的 JSON 值，其后的文字（可能含括号）忽略
    let mut stream = serde_json::Deserializer::from_str(&s[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(_)) => Ok(&s[start..start + stream.byte_offset()]),
        Some(Err(e)) => Err(AgentError::JsonExtract(format!(
            "Found a JSON-looking block but parsing failed: {e}"
        ))),
        None => Err(AgentError::JsonExtract(
            "No JSON object found in model output".to_string(),
        )),
    }
}

/// 解析一轮计划增量
pub fn parse_increment(raw: &str) -> Result<PlanIncrement, AgentError> {
    let json = extract_json_str(raw)?;
    serde_json::from_str(json).map_err(|e| AgentError::PlanParse(e.to_string()))
}

/// 解析收尾回复，得到最终答案
pub fn parse_closing_reply(raw: &str) -> Result<FinalAnswer, AgentError> {
    let json = extract_json_str(raw)?;
    let reply: ClosingReply =
        serde_json::from_str(json).map_err(|e| AgentError::PlanParse(e.to_string()))?;
    if !reply.tool_calls.is_empty() {
        return Err(AgentError::ClosingWithToolCalls(reply.tool_calls.len()));
    }
    reply.final_answer.ok_or(AgentError::MissingFinal)
}
