//! 占位符解析：任务参数中的 `${node:<id>.<path>}` 引用其它已完成任务的结果
//!
//! path 为点分 key 序列，每段可带若干方括号整数下标，如 `results[0].url`。
//!
//! 默认（Textual）为文本替换：字符串中的每个占位符被替换为目标值的「字符串形式」，
//! 字符串取原文，其它值取紧凑 JSON。因此引用对象或数组时嵌入的是它的文本，而不是结构本身；
//! 这是有意保留的行为。Structured 模式下，若整个字符串恰好是一个占位符，则直接替换为目标 JSON 值，
//! 其余情况仍按文本替换。
//!
//! 引用的节点不存在、路径不存在、下标越界或类型不匹配都是硬错误，调用方应把任务标记为 Error，
//! 不会出现部分替换的参数。

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 占位符替换模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    #[default]
    Textual,
    Structured,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaceholderError {
    #[error("Missing node result for '{0}'")]
    MissingNode(String),

    #[error("Key '{key}' not found while resolving '{node}.{path}'")]
    MissingKey { node: String, path: String, key: String },

    #[error("Index {index} out of range (len {len}) while resolving '{node}.{path}'")]
    IndexOutOfRange {
        node: String,
        path: String,
        index: usize,
        len: usize,
    },

    #[error("Cannot apply '{segment}' to {found} while resolving '{node}.{path}'")]
    TypeMismatch {
        node: String,
        path: String,
        segment: String,
        found: &'static str,
    },

    #[error("Bad path '{path}' in reference to '{node}'")]
    BadPath { node: String, path: String },
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{node:([^.}]+)\.([^}]+)\}").expect("valid placeholder regex"))
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(k) => write!(f, "{k}"),
            Segment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum PathState {
    ExpectKey,
    InKey,
    AfterIndex,
}

fn parse_path(node: &str, path: &str) -> Result<Vec<Segment>, PlaceholderError> {
    let bad = || PlaceholderError::BadPath {
        node: node.to_string(),
        path: path.to_string(),
    };
    let mut segments = Vec::new();
    let mut key = String::new();
    let mut state = PathState::ExpectKey;
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                match state {
                    PathState::InKey => segments.push(Segment::Key(std::mem::take(&mut key))),
                    PathState::AfterIndex => {}
                    PathState::ExpectKey => return Err(bad()),
                }
                state = PathState::ExpectKey;
            }
            '[' => {
                match state {
                    PathState::InKey => segments.push(Segment::Key(std::mem::take(&mut key))),
                    PathState::AfterIndex => {}
                    PathState::ExpectKey => return Err(bad()),
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => return Err(bad()),
                    }
                }
                let index = digits.parse::<usize>().map_err(|_| bad())?;
                segments.push(Segment::Index(index));
                state = PathState::AfterIndex;
            }
            ']' => return Err(bad()),
            other => {
                if state == PathState::AfterIndex {
                    return Err(bad());
                }
                key.push(other);
                state = PathState::InKey;
            }
        }
    }

    match state {
        PathState::ExpectKey => Err(bad()),
        PathState::InKey => {
            segments.push(Segment::Key(key));
            Ok(segments)
        }
        PathState::AfterIndex => Ok(segments),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 在 value 上按 path 取值；node 仅用于错误信息
pub fn lookup_path<'v>(value: &'v Value, node: &str, path: &str) -> Result<&'v Value, PlaceholderError> {
    let mut cur = value;
    for segment in parse_path(node, path)? {
        cur = match (&segment, cur) {
            (Segment::Key(key), Value::Object(map)) => {
                map.get(key).ok_or_else(|| PlaceholderError::MissingKey {
                    node: node.to_string(),
                    path: path.to_string(),
                    key: key.clone(),
                })?
            }
            (Segment::Index(index), Value::Array(items)) => {
                items.get(*index).ok_or_else(|| PlaceholderError::IndexOutOfRange {
                    node: node.to_string(),
                    path: path.to_string(),
                    index: *index,
                    len: items.len(),
                })?
            }
            (segment, other) => {
                return Err(PlaceholderError::TypeMismatch {
                    node: node.to_string(),
                    path: path.to_string(),
                    segment: segment.to_string(),
                    found: type_name(other),
                })
            }
        };
    }
    Ok(cur)
}

fn reference<'e>(env: &'e HashMap<String, Value>, node: &str, path: &str) -> Result<&'e Value, PlaceholderError> {
    let root = env
        .get(node)
        .ok_or_else(|| PlaceholderError::MissingNode(node.to_string()))?;
    lookup_path(root, node, path)
}

/// 文本替换时使用的字符串形式
fn textual(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_str(s: &str, env: &HashMap<String, Value>, mode: ResolveMode) -> Result<Value, PlaceholderError> {
    let re = placeholder_re();
    if !re.is_match(s) {
        return Ok(Value::String(s.to_string()));
    }

    if mode == ResolveMode::Structured {
        if let Some(caps) = re.captures(s) {
            if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
                return reference(env, &caps[1], &caps[2]).cloned();
            }
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&s[last..whole.start()]);
        out.push_str(&textual(reference(env, &caps[1], &caps[2])?));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// 递归解析 value 中的全部占位符；env 为「任务 ID -> 结果」，只应包含已完成（Done）的任务
pub fn resolve_placeholders(
    value: &Value,
    env: &HashMap<String, Value>,
    mode: ResolveMode,
) -> Result<Value, PlaceholderError> {
    match value {
        Value::String(s) => resolve_str(s, env, mode),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_placeholders(v, env, mode))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_placeholders(v, env, mode)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// 收集 value 中引用到的全部节点 ID
pub fn referenced_nodes(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_refs(value, &mut out);
    out
}

fn collect_refs(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in placeholder_re().captures_iter(s) {
                out.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

/// 按 remap 表改写占位符中的节点 ID（计划内 ID 冲突被重新分配时使用）
pub fn rewrite_node_ids(value: &Value, remap: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => {
            let rewritten = placeholder_re().replace_all(s, |caps: &Captures| {
                let node = &caps[1];
                let node = remap.get(node).map(String::as_str).unwrap_or(node);
                format!("${{node:{}.{}}}", node, &caps[2])
            });
            Value::String(rewritten.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_node_ids(v, remap)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_node_ids(v, remap)))
                .collect(),
        ),
        other => other.clone(),
    }
}
