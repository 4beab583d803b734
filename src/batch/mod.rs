//! 批处理：任务账本模型、持久化协作者（内存 / SQLite）与批处理编排

pub mod memory;
pub mod orchestrator;
pub mod sqlite;
pub mod store;
pub mod types;

pub use memory::{MemoryLedger, MemoryRecordSink, MemoryWorkItems};
pub use orchestrator::{BatchOrchestrator, BatchRequest};
pub use sqlite::SqliteStore;
pub use store::{JobLedger, RecordSink, StoreError, WorkItemSource};
pub use types::{
    BatchItemLog, BatchJob, ItemStatus, JobStatus, KnowledgeRecord, NewJob, JOB_TYPE_KNOWLEDGE,
};
