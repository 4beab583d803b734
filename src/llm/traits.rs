//! 补全能力抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Scripted Mock）实现 CompletionClient：
//! 输入阶段标识、阶段 Prompt、阶段输入与会话上下文，返回原始文本或已结构化的映射。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::stage::StageId;

/// 补全能力错误：按是否可重试分类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    /// 收到响应但无法取出内容
    #[error("malformed response: {0}")]
    Malformed(String),

    /// 鉴权失败、模型不存在等，不可重试
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout
                | LlmError::RateLimited { .. }
                | LlmError::Network(_)
                | LlmError::Server(_)
        )
    }
}

/// 补全能力的原始输出：文本（可能被代码围栏包裹）或已结构化的映射
#[derive(Debug, Clone, PartialEq)]
pub enum RawCompletion {
    Text(String),
    Structured(serde_json::Value),
}

impl RawCompletion {
    /// 诊断用的原始文本
    pub fn as_raw_text(&self) -> String {
        match self {
            RawCompletion::Text(text) => text.clone(),
            RawCompletion::Structured(value) => value.to_string(),
        }
    }
}

/// 会话上下文：会话 ID、轮次与附加元数据（批处理时为任务 ID 与分块信息）
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionContext {
    pub session_id: String,
    pub turn: u64,
    pub metadata: serde_json::Value,
}

impl SessionContext {
    pub fn conversation(session_id: impl Into<String>, turn: u64) -> Self {
        Self {
            session_id: session_id.into(),
            turn,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// 一次补全请求
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub stage: StageId,
    pub system_prompt: &'a str,
    pub input: &'a str,
    pub session: &'a SessionContext,
}

/// 补全能力 trait
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<RawCompletion, LlmError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str {
        "unknown"
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Server("502".into()).is_transient());
        assert!(!LlmError::Malformed("empty".into()).is_transient());
        assert!(!LlmError::Unavailable("401".into()).is_transient());
    }

    #[test]
    fn test_raw_text_of_structured() {
        let raw = RawCompletion::Structured(serde_json::json!({"status": "answered"}));
        assert_eq!(raw.as_raw_text(), r#"{"status":"answered"}"#);
    }
}
