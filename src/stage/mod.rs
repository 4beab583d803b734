//! 阶段层：阶段标识、输入/输出 Schema 分派表、提示词、调用与响应解析

pub mod id;
pub mod invoker;
pub mod parser;
pub mod prompts;
pub mod registry;
pub mod result;
pub mod schema;

pub use id::{StageId, UnknownStage};
pub use invoker::StageInvoker;
pub use parser::{unwrap_fenced_json, ParseError, ResponseParser};
pub use prompts::{PRESENT_MARKER, RECOVERY_MARKER};
pub use registry::{StageRegistry, StageSpec};
pub use result::{Dossier, StageInput, StageResult};
pub use schema::{InputKind, ItemSchema, StageSchema};
