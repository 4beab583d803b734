//! Triage - Rust 多阶段工单分诊管线
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复话术、协作式中断
//! - **llm**: 补全能力抽象与实现（OpenAI 兼容 / DeepSeek / Scripted）、重试策略
//! - **stage**: 阶段标识、Schema 分派表、提示词、StageInvoker、ResponseParser
//! - **triage**: 会话状态、Router、ConversationOrchestrator、会话存储
//! - **batch**: 批处理账本模型、持久化协作者（内存 / SQLite）、BatchOrchestrator
//! - **observability**: tracing 初始化

pub mod batch;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod stage;
pub mod triage;

pub use batch::{BatchJob, BatchOrchestrator, BatchRequest, JobStatus};
pub use config::{load_config, AppConfig};
pub use core::TriageError;
pub use stage::{StageId, StageInvoker, StageRegistry};
pub use triage::{ChatRequest, ChatResponse, ConversationOrchestrator, TurnEvent, TurnReply};
