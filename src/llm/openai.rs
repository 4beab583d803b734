//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 每次补全只发两条消息：阶段 Prompt（system）与阶段输入（user）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{CompletionClient, CompletionRequest, LlmError, RawCompletion};
use crate::stage::StageId;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client、默认模型与按阶段覆盖的模型
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    stage_models: HashMap<StageId, String>,
    timeout: Duration,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str, timeout: Duration) -> Self {
        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            stage_models: HashMap::new(),
            timeout,
            usage: TokenUsage::new(),
        }
    }

    pub fn with_stage_models(mut self, stage_models: HashMap<StageId, String>) -> Self {
        self.stage_models = stage_models;
        self
    }

    pub fn model_for(&self, stage: StageId) -> &str {
        self.stage_models
            .get(&stage)
            .map(String::as_str)
            .unwrap_or(&self.model)
    }

    fn to_openai_messages(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(request.system_prompt.to_string())
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(request.input.to_string())
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

/// 将 SDK 错误归类为可重试 / 不可重试
fn classify(err: OpenAIError) -> LlmError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("rate_limit") {
        return LlmError::RateLimited { retry_after_ms: None };
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return LlmError::Timeout;
    }
    match err {
        OpenAIError::ApiError(api) => {
            let detail = format!("{:?}", api).to_lowercase();
            if detail.contains("invalid_api_key")
                || detail.contains("model_not_found")
                || detail.contains("insufficient_quota")
                || lower.contains("401")
                || lower.contains("403")
            {
                LlmError::Unavailable(text)
            } else {
                LlmError::Server(text)
            }
        }
        OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg),
        OpenAIError::JSONDeserialize(..) => LlmError::Malformed(text),
        _ => LlmError::Network(text),
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<RawCompletion, LlmError> {
        let api_request = CreateChatCompletionRequestArgs::default()
            .model(self.model_for(request.stage))
            .messages(self.to_openai_messages(&request)?)
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(api_request))
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(classify)?;

        // 提取 token 使用统计
        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Malformed("response has no message content".to_string()))?;

        if content.trim().is_empty() {
            return Err(LlmError::Malformed("empty message content".to_string()));
        }
        Ok(RawCompletion::Text(content))
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}
