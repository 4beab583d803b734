//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRIAGE__*` 覆盖（双下划线表示嵌套，如 `TRIAGE__LLM__PROVIDER=openai`）。
//! 配置对象在进程启动时构建一次，以 `Arc<AppConfig>` 传给各编排器，不存在全局单例。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::TriageError;
use crate::llm::{RetryConfig, DEEPSEEK_CHAT};
use crate::stage::StageId;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub batch: BatchSection,
}

/// [app] 段：应用名、单轮最大阶段跳数、Prompt 覆盖目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 单轮对话内部最多执行的阶段数，超出即以恢复话术让出控制
    #[serde(default = "default_max_stage_hops")]
    pub max_stage_hops: usize,
    /// `<stage>.txt` 形式的 Prompt 覆盖目录
    pub prompts_dir: Option<PathBuf>,
    /// 协调阶段可见的最近用户消息条数
    #[serde(default = "default_transcript_window")]
    pub transcript_window: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_stage_hops: default_max_stage_hops(),
            prompts_dir: None,
            transcript_window: default_transcript_window(),
        }
    }
}

fn default_max_stage_hops() -> usize {
    8
}

fn default_transcript_window() -> usize {
    10
}

/// [llm] 段：后端选择、模型、超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 未配置时按 provider 取默认模型（见 `AppConfig::model_name`）
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名；未配置时按 provider 取默认（OPENAI_API_KEY / DEEPSEEK_API_KEY）
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    /// 按阶段覆盖模型，键为阶段名（未知阶段名在启动时报错）
    #[serde(default)]
    pub stage_models: HashMap<String, String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            api_key_env: None,
            timeouts: LlmTimeoutsSection::default(),
            stage_models: HashMap::new(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

/// [retry] 段：批处理重试与交互轮次重试
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 交互轮次最多尝试次数（含首次），即最多重试一次
    #[serde(default = "default_interactive_max_attempts")]
    pub interactive_max_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            interactive_max_attempts: default_interactive_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_interactive_max_attempts() -> u32 {
    2
}

impl RetrySection {
    /// 批处理使用的重试策略（1s / 2s / 4s ...）
    pub fn batch_policy(&self) -> RetryConfig {
        RetryConfig::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    /// 交互轮次使用的重试策略
    pub fn interactive_policy(&self) -> RetryConfig {
        RetryConfig::new(
            self.interactive_max_attempts.clamp(1, 2),
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// [batch] 段：批大小、并发、错误信息截断、SQLite 路径
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub max_items: Option<usize>,
    /// 同时在途的分块数；1 即按块串行
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_error_message_max_len")]
    pub error_message_max_len: usize,
    /// 序列化后的阶段输入低于该长度视为无效分块
    #[serde(default = "default_min_input_chars")]
    pub min_input_chars: usize,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// 批处理阶段名
    #[serde(default = "default_batch_stage")]
    pub stage: String,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_items: None,
            concurrency: default_concurrency(),
            error_message_max_len: default_error_message_max_len(),
            min_input_chars: default_min_input_chars(),
            database_path: default_database_path(),
            stage: default_batch_stage(),
        }
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_concurrency() -> usize {
    1
}

fn default_error_message_max_len() -> usize {
    500
}

fn default_min_input_chars() -> usize {
    10
}

fn default_database_path() -> PathBuf {
    PathBuf::from("triage.db")
}

fn default_batch_stage() -> String {
    "knowledge_builder".to_string()
}

impl AppConfig {
    /// 实际使用的默认模型：显式配置优先，否则按 provider 取默认
    pub fn model_name(&self) -> String {
        if let Some(model) = self.llm.model.as_deref().filter(|m| !m.trim().is_empty()) {
            return model.to_string();
        }
        match self.llm.provider.to_lowercase().as_str() {
            "deepseek" => std::env::var("DEEPSEEK_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEEPSEEK_CHAT.to_string()),
            "mock" => "scripted".to_string(),
            _ => OPENAI_DEFAULT_MODEL.to_string(),
        }
    }

    /// 存放 API Key 的环境变量名
    pub fn api_key_env(&self) -> &str {
        if let Some(name) = self.llm.api_key_env.as_deref().filter(|n| !n.trim().is_empty()) {
            return name;
        }
        if self.llm.provider.eq_ignore_ascii_case("deepseek") {
            "DEEPSEEK_API_KEY"
        } else {
            "OPENAI_API_KEY"
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeouts.request.max(1))
    }

    /// 解析 [llm.stage_models]，未知阶段名视为致命配置错误
    pub fn stage_models(&self) -> Result<HashMap<StageId, String>, TriageError> {
        self.llm
            .stage_models
            .iter()
            .map(|(name, model)| {
                name.parse::<StageId>()
                    .map(|id| (id, model.clone()))
                    .map_err(|e| TriageError::FatalConfiguration(e.to_string()))
            })
            .collect()
    }

    /// 所选后端需要 API Key 时读取之；缺失即致命配置错误（任何批任务创建之前）
    pub fn require_api_key(&self) -> Result<Option<String>, TriageError> {
        if self.llm.provider.eq_ignore_ascii_case("mock") {
            return Ok(None);
        }
        let key_env = self.api_key_env();
        match std::env::var(key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => Err(TriageError::FatalConfiguration(format!(
                "environment variable {} is not set for provider '{}'",
                key_env, self.llm.provider
            ))),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TRIAGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TRIAGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRIAGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.batch.batch_size, 1);
        assert_eq!(cfg.batch.error_message_max_len, 500);
        assert_eq!(cfg.app.max_stage_hops, 8);
    }

    #[test]
    fn test_model_and_key_env_follow_provider() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.model_name(), "gpt-4o-mini");
        assert_eq!(cfg.api_key_env(), "OPENAI_API_KEY");

        cfg.llm.provider = "deepseek".to_string();
        assert_eq!(cfg.api_key_env(), "DEEPSEEK_API_KEY");
        if std::env::var("DEEPSEEK_MODEL").is_err() {
            assert_eq!(cfg.model_name(), DEEPSEEK_CHAT);
        }

        cfg.llm.model = Some("deepseek-reasoner".to_string());
        cfg.llm.api_key_env = Some("MY_KEY".to_string());
        assert_eq!(cfg.model_name(), "deepseek-reasoner");
        assert_eq!(cfg.api_key_env(), "MY_KEY");
    }

    #[test]
    fn test_interactive_policy_retries_at_most_once() {
        let mut section = RetrySection::default();
        section.interactive_max_attempts = 5;
        assert_eq!(section.interactive_policy().max_attempts, 2);
    }

    #[test]
    fn test_unknown_stage_model_is_fatal() {
        let mut cfg = AppConfig::default();
        cfg.llm
            .stage_models
            .insert("N9_Unknown".to_string(), "gpt-4o".to_string());
        assert!(matches!(
            cfg.stage_models(),
            Err(TriageError::FatalConfiguration(_))
        ));
    }

    #[test]
    fn test_mock_provider_needs_no_key() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        assert!(matches!(cfg.require_api_key(), Ok(None)));
    }
}
