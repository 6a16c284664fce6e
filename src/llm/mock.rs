//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按脚本顺序返回预设回复或错误，并记录每次收到的 prompt / system；
//! 脚本耗尽后回显请求首行作为最终答案，保证规划循环能够正常结束。

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

/// 一次 generate 调用的记录
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPrompt {
    pub prompt: String,
    pub system: Option<String>,
}

/// Mock 客户端：脚本化回复
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<RecordedPrompt>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回给定文本
    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for r in responses {
            mock.push_response(r);
        }
        mock
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    /// 迄今收到的全部调用
    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn echo_final(prompt: &str) -> String {
        let first_line = prompt.lines().next().unwrap_or("(no input)").trim();
        serde_json::json!({
            "tool_calls": [],
            "final": { "answer": format!("Echo from Mock: {first_line}") }
        })
        .to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, LlmError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedPrompt {
                prompt: prompt.to_string(),
                system: system.map(str::to_string),
            });

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(reply) => reply,
            None => Ok(Self::echo_final(prompt)),
        }
    }
}
