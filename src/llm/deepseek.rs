//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 默认模型 deepseek-chat；可用 `DEEPSEEK_MODEL` 或 `[llm] model` 覆盖（如 deepseek-reasoner）
//! - API Key 默认读 `DEEPSEEK_API_KEY`

use std::time::Duration;

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 客户端；模型由 `AppConfig::model_name` 解析
pub fn create_deepseek_client(model: &str, api_key: &str, timeout: Duration) -> OpenAiClient {
    OpenAiClient::new(Some(DEEPSEEK_BASE_URL), model, api_key, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::stage::StageId;

    #[test]
    fn test_default_config_uses_deepseek_chat() {
        if std::env::var("DEEPSEEK_MODEL").is_ok() {
            return;
        }
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "deepseek".to_string();
        let client = create_deepseek_client(&cfg.model_name(), "sk-test", Duration::from_secs(5));
        assert_eq!(client.model_for(StageId::Lookup), DEEPSEEK_CHAT);
    }

    #[test]
    fn test_stage_override_wins() {
        let client = create_deepseek_client(DEEPSEEK_CHAT, "sk-test", Duration::from_secs(5))
            .with_stage_models([(StageId::Diagnosis, "deepseek-reasoner".to_string())].into());
        assert_eq!(client.model_for(StageId::Diagnosis), "deepseek-reasoner");
        assert_eq!(client.model_for(StageId::Lookup), DEEPSEEK_CHAT);
    }
}
