//! LLM 层：补全能力抽象与实现（OpenAI 兼容 / DeepSeek / Scripted Mock）、重试策略

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use mock::{RecordedCall, ScriptedClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use retry::{retry_with_backoff, RetryConfig};
pub use traits::{CompletionClient, CompletionRequest, LlmError, RawCompletion, SessionContext};

use crate::config::AppConfig;
use crate::core::TriageError;

/// 根据配置选择补全后端；缺少 API Key 或 provider 未知时返回致命配置错误
pub fn create_client_from_config(cfg: &AppConfig) -> Result<Arc<dyn CompletionClient>, TriageError> {
    let provider = cfg.llm.provider.to_lowercase();
    let stage_models = cfg.stage_models()?;

    match provider.as_str() {
        "mock" => {
            tracing::warn!("Using scripted mock completion client (offline demo)");
            Ok(Arc::new(ScriptedClient::demo()))
        }
        "deepseek" => {
            let key = cfg.require_api_key()?.unwrap_or_default();
            let model = cfg.model_name();
            tracing::info!("Using DeepSeek completion client ({})", model);
            Ok(Arc::new(
                create_deepseek_client(&model, &key, cfg.request_timeout())
                    .with_stage_models(stage_models),
            ))
        }
        "openai" => {
            let key = cfg.require_api_key()?.unwrap_or_default();
            let model = cfg.model_name();
            tracing::info!("Using OpenAI-compatible completion client ({})", model);
            Ok(Arc::new(
                OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &model,
                    &key,
                    cfg.request_timeout(),
                )
                .with_stage_models(stage_models),
            ))
        }
        other => Err(TriageError::FatalConfiguration(format!(
            "unknown llm provider '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_is_fatal() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "gemini-via-carrier-pigeon".to_string();
        assert!(matches!(
            create_client_from_config(&cfg),
            Err(TriageError::FatalConfiguration(_))
        ));
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key_env = Some("TRIAGE_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        assert!(matches!(
            create_client_from_config(&cfg),
            Err(TriageError::FatalConfiguration(_))
        ));
    }

    #[test]
    fn test_mock_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        let client = create_client_from_config(&cfg).unwrap();
        assert_eq!(client.name(), "scripted");
    }
}
