//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::generate：给定 prompt 与可选 system 指令，返回文本。
//! 失败统一为 LlmError，并按 FailureKind 分类，供 RetryExecutor 判断是否值得重试。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::retry::{Classify, FailureKind};

/// LLM 调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    Server(String),

    /// 请求本身无效（鉴权失败、参数错误等），重试无意义
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("LLM error: {0}")]
    Other(String),
}

impl LlmError {
    /// 根据后端返回的错误文本粗分类（后端 SDK 的错误类型各不相同，统一按文本判断）
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
            LlmError::RateLimited { retry_after_ms: 1000 }
        } else if lower.contains("timed out") || lower.contains("timeout") {
            LlmError::Timeout
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("invalid api key")
            || lower.contains("incorrect api key")
            || lower.contains("invalid_request")
        {
            LlmError::InvalidRequest(message)
        } else if lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("overloaded")
        {
            LlmError::Server(message)
        } else if lower.contains("connection") || lower.contains("error sending request") || lower.contains("dns") {
            LlmError::Network(message)
        } else {
            LlmError::Other(message)
        }
    }
}

impl Classify for LlmError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            LlmError::Timeout => FailureKind::Timeout,
            LlmError::RateLimited { .. } => FailureKind::RateLimited,
            LlmError::Network(_) => FailureKind::Network,
            LlmError::Server(_) => FailureKind::Server,
            LlmError::InvalidRequest(_) => FailureKind::InvalidInput,
            LlmError::Other(_) => FailureKind::Transient,
        }
    }
}

/// LLM 客户端 trait：可重复调用（足够幂等，允许重试）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 给定 prompt 与可选 system 指令生成文本
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
