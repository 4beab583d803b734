//! 分诊错误类型与失败分类
//!
//! TriageError 是全 crate 的错误分类；FailureKind 是写入合成 StageResult 的精简标记，
//! 供 Router 回退与 RecoveryEngine 选择面向用户的话术。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::stage::{ParseError, StageId};

/// 分诊过程中可能出现的错误（补全能力、解析、持久化、配置等）
#[derive(Error, Debug)]
pub enum TriageError {
    /// 网络 / 超时 / 限流，可重试
    #[error("Transient failure: {0}")]
    TransientFailure(String),

    /// 收到响应但连最基本的格式都不满足，本组件不重试
    #[error("Malformed capability response: {0}")]
    MalformedCapabilityResponse(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// 结构合法但不满足业务约束（如批处理记录数多于输入）
    #[error("Schema validation error: {0}")]
    SchemaValidation(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 补全能力不可用（鉴权失败等），不可重试
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Invalid input for stage {stage}: expected {expected}")]
    InvalidStageInput { stage: StageId, expected: &'static str },

    /// 启动时缺少必需的外部依赖（如 API Key），在创建任何任务之前终止
    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("Interrupted")]
    Interrupted,
}

impl TriageError {
    /// 是否值得按退避策略重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, TriageError::TransientFailure(_))
    }

    /// 是否应终止整个批处理运行（而不仅是当前分块）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TriageError::CapabilityUnavailable(_) | TriageError::FatalConfiguration(_)
        )
    }

    /// 错误类别名，写入运维日志
    pub fn class(&self) -> &'static str {
        match self {
            TriageError::TransientFailure(_) => "TransientFailure",
            TriageError::MalformedCapabilityResponse(_) => "MalformedCapabilityResponse",
            TriageError::Parse(_) => "ParseError",
            TriageError::SchemaValidation(_) => "SchemaValidationError",
            TriageError::Persistence(_) => "PersistenceError",
            TriageError::CapabilityUnavailable(_) => "CapabilityUnavailable",
            TriageError::InvalidStageInput { .. } => "InvalidStageInput",
            TriageError::FatalConfiguration(_) => "FatalConfigurationError",
            TriageError::Interrupted => "Interrupted",
        }
    }
}

impl From<LlmError> for TriageError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Malformed(msg) => TriageError::MalformedCapabilityResponse(msg),
            LlmError::Unavailable(msg) => TriageError::CapabilityUnavailable(msg),
            LlmError::InvalidRequest(msg) => TriageError::CapabilityUnavailable(msg),
            other => TriageError::TransientFailure(other.to_string()),
        }
    }
}

/// 合成 StageResult 上的失败标记（不含原始错误文本）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Malformed,
    InvalidPayload,
    Unavailable,
}

impl From<&TriageError> for FailureKind {
    fn from(err: &TriageError) -> Self {
        match err {
            TriageError::TransientFailure(_) | TriageError::Interrupted => FailureKind::Transient,
            TriageError::MalformedCapabilityResponse(_) => FailureKind::Malformed,
            TriageError::Parse(_)
            | TriageError::SchemaValidation(_)
            | TriageError::InvalidStageInput { .. } => FailureKind::InvalidPayload,
            TriageError::Persistence(_)
            | TriageError::CapabilityUnavailable(_)
            | TriageError::FatalConfiguration(_) => FailureKind::Unavailable,
        }
    }
}

/// 按字符截断，超出部分以省略号结尾（写账本 / 日志用）
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
