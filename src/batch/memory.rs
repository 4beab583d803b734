//! 内存实现：测试与离线演示用

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::batch::{
    BatchItemLog, BatchJob, JobLedger, JobStatus, KnowledgeRecord, NewJob, RecordSink,
    StoreError, WorkItemSource,
};
use crate::stage::Dossier;

#[derive(Debug, Clone)]
struct Ticket {
    dossier: Option<String>,
    processed: bool,
}

/// 内存工单源
#[derive(Debug, Default)]
pub struct MemoryWorkItems {
    tickets: Mutex<BTreeMap<i64, Ticket>>,
}

impl MemoryWorkItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 (ID, 卷宗) 列表构建
    pub fn with_tickets<I, S>(tickets: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: Into<String>,
    {
        let map = tickets
            .into_iter()
            .map(|(id, dossier)| {
                (
                    id,
                    Ticket {
                        dossier: Some(dossier.into()),
                        processed: false,
                    },
                )
            })
            .collect();
        Self {
            tickets: Mutex::new(map),
        }
    }

    /// 登记一张无法生成卷宗的工单
    pub async fn insert_without_dossier(&self, id: i64) {
        self.tickets.lock().await.insert(
            id,
            Ticket {
                dossier: None,
                processed: false,
            },
        );
    }

    pub async fn is_processed(&self, id: i64) -> bool {
        self.tickets
            .lock()
            .await
            .get(&id)
            .map(|t| t.processed)
            .unwrap_or(false)
    }

    pub async fn processed_ids(&self) -> Vec<i64> {
        self.tickets
            .lock()
            .await
            .iter()
            .filter(|(_, t)| t.processed)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl WorkItemSource for MemoryWorkItems {
    async fn fetch_unprocessed(&self, limit: Option<usize>) -> Result<Vec<i64>, StoreError> {
        let tickets = self.tickets.lock().await;
        Ok(tickets
            .iter()
            .filter(|(_, t)| !t.processed)
            .map(|(id, _)| *id)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn load_dossiers(&self, ids: &[i64]) -> Result<Vec<Dossier>, StoreError> {
        let tickets = self.tickets.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                tickets
                    .get(id)
                    .and_then(|t| t.dossier.clone())
                    .map(|dossier| Dossier {
                        ticket_id: *id,
                        dossier,
                    })
            })
            .collect())
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<(), StoreError> {
        let mut tickets = self.tickets.lock().await;
        for id in ids {
            if let Some(ticket) = tickets.get_mut(id) {
                ticket.processed = true;
            }
        }
        Ok(())
    }
}

/// 内存知识库；按 ticket_id 覆盖写入
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<(String, KnowledgeRecord)>>,
    failing: AtomicBool,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的写入全部失败（模拟数据库故障）
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<KnowledgeRecord> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn save_batch(&self, records: &[KnowledgeRecord]) -> Result<Vec<String>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database("knowledge base is unavailable".into()));
        }
        let mut stored = self.records.lock().await;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            match stored.iter_mut().find(|(_, r)| r.ticket_id == record.ticket_id) {
                Some((id, existing)) => {
                    *existing = record.clone();
                    ids.push(id.clone());
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    stored.push((id.clone(), record.clone()));
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    jobs: HashMap<String, BatchJob>,
    logs: Vec<(String, BatchItemLog)>,
}

/// 内存账本
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
    finalize_calls: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job(&self, job_id: &str) -> Option<BatchJob> {
        self.inner.lock().await.jobs.get(job_id).cloned()
    }

    pub async fn logs_for(&self, job_id: &str) -> Vec<BatchItemLog> {
        self.inner
            .lock()
            .await
            .logs
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, log)| log.clone())
            .collect()
    }

    pub async fn job_count(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    /// finalize_job 被调用的次数（含被拒绝的重复调用）
    pub fn finalize_count(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

fn running_job<'a>(inner: &'a mut LedgerInner, job_id: &str) -> Result<&'a mut BatchJob, StoreError> {
    let job = inner
        .jobs
        .get_mut(job_id)
        .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
    if job.status.is_terminal() {
        return Err(StoreError::InvalidTransition {
            job_id: job_id.to_string(),
            from: job.status,
            to: job.status,
        });
    }
    Ok(job)
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn create_job(&self, job: &NewJob) -> Result<String, StoreError> {
        let job_id = Uuid::new_v4().to_string();
        self.inner
            .lock()
            .await
            .jobs
            .insert(job_id.clone(), BatchJob::new(job_id.clone(), job));
        Ok(job_id)
    }

    async fn append_item_logs(
        &self,
        job_id: &str,
        logs: &[BatchItemLog],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        running_job(&mut inner, job_id)?;
        inner
            .logs
            .extend(logs.iter().map(|log| (job_id.to_string(), log.clone())));
        Ok(())
    }

    async fn update_progress(
        &self,
        job_id: &str,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = running_job(&mut inner, job_id)?;
        job.succeeded_count = succeeded;
        job.failed_count = failed;
        Ok(())
    }

    async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
        error_summary: Option<&str>,
    ) -> Result<(), StoreError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))?;
        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        job.succeeded_count = succeeded;
        job.failed_count = failed;
        job.error_summary = error_summary.map(str::to_string);
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn record_chunk(
        &self,
        job_id: &str,
        logs: &[BatchItemLog],
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = running_job(&mut inner, job_id)?;
        job.succeeded_count = succeeded;
        job.failed_count = failed;
        inner
            .logs
            .extend(logs.iter().map(|log| (job_id.to_string(), log.clone())));
        Ok(())
    }
}
