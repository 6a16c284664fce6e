//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek 使用同一客户端的预设。
//! 单次请求受 request_timeout 限制，超时映射为 LlmError::Timeout。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 累计 token 计数；total 由 prompt + completion 得出
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    pub fn record(&self, prompt: u64, completion: u64) {
        self.prompt.fetch_add(prompt, Ordering::Relaxed);
        self.completion.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn totals(&self) -> (u64, u64, u64) {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// OpenAI 兼容客户端：持有 Client、model 名与请求超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
    usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, request_timeout: Duration) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout,
            usage: TokenUsage::default(),
        }
    }

    /// DeepSeek 预设：优先 DEEPSEEK_API_KEY，其次 OPENAI_API_KEY
    pub fn deepseek(model: Option<&str>, request_timeout: Duration) -> Self {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        let model = model.unwrap_or(DEEPSEEK_CHAT);
        Self::new(Some(DEEPSEEK_BASE_URL), model, api_key.as_deref(), request_timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_messages(
        prompt: &str,
        system: Option<&str>,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            let msg = ChatCompletionRequestSystemMessageArgs::default()
                .content(system.to_string())
                .build()
                .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
            messages.push(ChatCompletionRequestMessage::System(msg));
        }
        let msg = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.to_string())
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        messages.push(ChatCompletionRequestMessage::User(msg));
        Ok(messages)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::build_messages(prompt, system)?)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::from_message(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .record(u64::from(usage.prompt_tokens), u64::from(usage.completion_tokens));
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.totals()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::default();
        usage.record(10, 5);
        usage.record(3, 2);
        assert_eq!(usage.totals(), (13, 7, 20));
    }

    #[test]
    fn test_messages_put_system_first() {
        let messages = OpenAiClient::build_messages("hi", Some("be brief")).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert_eq!(OpenAiClient::build_messages("hi", None).unwrap().len(), 1);
    }

    #[test]
    fn test_deepseek_preset_model() {
        let client = OpenAiClient::deepseek(None, Duration::from_secs(5));
        assert_eq!(client.model(), DEEPSEEK_CHAT);
        assert_eq!(client.token_usage(), (0, 0, 0));
    }
}
