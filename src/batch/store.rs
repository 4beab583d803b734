//! 批处理的外部持久化协作者
//!
//! - WorkItemSource：待处理工单的来源，生成卷宗并标记已处理
//! - RecordSink：知识记录写入
//! - JobLedger：任务账本（任务行 + 条目日志）
//!
//! 一个分块的条目日志与计数增量必须一起写入（record_chunk），不能与其他分块交错。

use async_trait::async_trait;
use thiserror::Error;

use crate::batch::{BatchItemLog, JobStatus, KnowledgeRecord, NewJob};
use crate::core::TriageError;
use crate::stage::Dossier;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Join(err.to_string())
    }
}

impl From<StoreError> for TriageError {
    fn from(err: StoreError) -> Self {
        TriageError::Persistence(err.to_string())
    }
}

#[async_trait]
pub trait WorkItemSource: Send + Sync {
    /// 尚未处理的条目 ID，按 ID 升序；limit 为 None 时返回全部
    async fn fetch_unprocessed(&self, limit: Option<usize>) -> Result<Vec<i64>, StoreError>;

    /// 为给定条目生成卷宗；无法生成卷宗的条目不出现在结果中
    async fn load_dossiers(&self, ids: &[i64]) -> Result<Vec<Dossier>, StoreError>;

    async fn mark_processed(&self, ids: &[i64]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// 批量写入，返回与输入一一对应的记录 ID
    async fn save_batch(&self, records: &[KnowledgeRecord]) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn create_job(&self, job: &NewJob) -> Result<String, StoreError>;

    async fn append_item_logs(&self, job_id: &str, logs: &[BatchItemLog])
        -> Result<(), StoreError>;

    /// 增量更新任务计数（任务仍为 RUNNING）
    async fn update_progress(
        &self,
        job_id: &str,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError>;

    /// 写入终态；只允许从 RUNNING 转出一次
    async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
        error_summary: Option<&str>,
    ) -> Result<(), StoreError>;

    /// 一个分块的日志与累计计数；实现方应保证原子性
    async fn record_chunk(
        &self,
        job_id: &str,
        logs: &[BatchItemLog],
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        self.append_item_logs(job_id, logs).await?;
        self.update_progress(job_id, succeeded, failed).await
    }
}
