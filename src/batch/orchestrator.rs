//! BatchOrchestrator：把一批工单分块送入同一个批处理阶段
//!
//! 每个分块：生成卷宗 → 调用阶段（带退避重试）→ 按 ticket_id 匹配记录 → 写知识库 → 标记已处理。
//! 分块失败只影响本分块（全部记 BATCH_FAILURE，不标记已处理），循环继续；
//! 补全能力不可用时停止启动新分块。关闭信号到来后同样不再启动新分块，在途分块照常结束。
//! 无论以何种方式退出，任务只收尾一次。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{future, stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::batch::{
    BatchItemLog, BatchJob, ItemStatus, JobLedger, JobStatus, KnowledgeRecord, NewJob,
    RecordSink, WorkItemSource, JOB_TYPE_KNOWLEDGE,
};
use crate::config::AppConfig;
use crate::core::{truncate_chars, TriageError};
use crate::llm::{RetryConfig, SessionContext};
use crate::stage::{Dossier, InputKind, StageId, StageInput, StageInvoker, StageResult};

/// 运维入口请求
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub stage_id: StageId,
    pub batch_size: usize,
    pub max_items: Option<usize>,
}

/// 分块循环的退出方式
#[derive(Debug)]
enum RunExit {
    Completed,
    Interrupted,
    Fatal(TriageError),
}

/// 单个分块的成功结果
struct ChunkAnalysis {
    saved: Vec<(i64, String)>,
    pending: Vec<i64>,
    skipped: Vec<i64>,
}

/// 单个分块的账本贡献
struct ChunkOutcome {
    index: usize,
    logs: Vec<BatchItemLog>,
    succeeded: usize,
    failed: usize,
    pending: usize,
    skipped: usize,
    error: Option<String>,
    fatal: Option<TriageError>,
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    pending: usize,
    skipped: usize,
    failed_chunks: usize,
    finished_chunks: usize,
    last_error: Option<String>,
}

pub struct BatchOrchestrator {
    invoker: StageInvoker,
    items: Arc<dyn WorkItemSource>,
    sink: Arc<dyn RecordSink>,
    ledger: Arc<dyn JobLedger>,
    retry: RetryConfig,
    concurrency: usize,
    error_message_max_len: usize,
    min_input_chars: usize,
    model_name: String,
    shutdown: CancellationToken,
}

impl BatchOrchestrator {
    pub fn new(
        invoker: StageInvoker,
        items: Arc<dyn WorkItemSource>,
        sink: Arc<dyn RecordSink>,
        ledger: Arc<dyn JobLedger>,
        cfg: &AppConfig,
    ) -> Self {
        let model_name = cfg
            .stage_models()
            .ok()
            .and_then(|m| m.get(&StageId::KnowledgeBuilder).cloned())
            .unwrap_or_else(|| cfg.model_name());
        Self {
            invoker,
            items,
            sink,
            ledger,
            retry: cfg.retry.batch_policy(),
            concurrency: cfg.batch.concurrency.max(1),
            error_message_max_len: cfg.batch.error_message_max_len.max(16),
            min_input_chars: cfg.batch.min_input_chars,
            model_name,
            shutdown: CancellationToken::new(),
        }
    }

    /// 接入关闭信号（通常来自 ShutdownManager::token）
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// 取出待处理工单并运行；没有待处理工单时不创建任务
    pub async fn run_pending(&self, request: BatchRequest) -> Result<Option<BatchJob>, TriageError> {
        let work_items = self.items.fetch_unprocessed(request.max_items).await?;
        if work_items.is_empty() {
            tracing::info!("No unprocessed items found; nothing to do");
            return Ok(None);
        }
        tracing::info!(found = work_items.len(), "Fetched unprocessed items");
        self.run(work_items, request.stage_id, request.batch_size)
            .await
            .map(Some)
    }

    /// 处理给定的工单列表
    pub async fn run(
        &self,
        work_items: Vec<i64>,
        stage: StageId,
        batch_size: usize,
    ) -> Result<BatchJob, TriageError> {
        if stage.schema().input != InputKind::Dossiers {
            return Err(TriageError::FatalConfiguration(format!(
                "stage {stage} does not accept dossier batches"
            )));
        }
        let batch_size = batch_size.max(1);
        let started = Instant::now();

        let new_job = NewJob {
            total_found: work_items.len(),
            batch_size,
            stage_id: stage,
            job_type: JOB_TYPE_KNOWLEDGE.to_string(),
        };
        let job_id = self.ledger.create_job(&new_job).await?;
        let mut job = BatchJob::new(job_id.clone(), &new_job);
        tracing::info!(
            job_id = %job_id,
            items = work_items.len(),
            batch_size,
            concurrency = self.concurrency,
            max_attempts = self.retry.max_attempts,
            "Batch job started"
        );

        let mut tally = Tally::default();
        let exit = self
            .drive_chunks(&job_id, &work_items, stage, batch_size, &mut tally)
            .await;

        let (status, error_summary) = match &exit {
            RunExit::Fatal(err) => (
                JobStatus::Failed,
                Some(format!("fatal error in worker: {err}")),
            ),
            RunExit::Interrupted => (
                JobStatus::Interrupted,
                Some(format!(
                    "interrupted by operator after {} chunk(s)",
                    tally.finished_chunks
                )),
            ),
            RunExit::Completed if tally.failed_chunks > 0 => (
                JobStatus::Failed,
                Some(format!(
                    "{} chunk(s) failed; last error: {}",
                    tally.failed_chunks,
                    tally.last_error.as_deref().unwrap_or("unknown")
                )),
            ),
            RunExit::Completed => (JobStatus::Completed, None),
        };
        let error_summary = error_summary.map(|s| truncate_chars(&s, self.error_message_max_len));

        job.status = status;
        job.succeeded_count = tally.succeeded;
        job.failed_count = tally.failed;
        job.pending_count = tally.pending;
        job.skipped_count = tally.skipped;
        job.error_summary = error_summary.clone();
        job.finished_at = Some(chrono::Utc::now());

        let finalized = self
            .ledger
            .finalize_job(
                &job_id,
                status,
                tally.succeeded,
                tally.failed,
                error_summary.as_deref(),
            )
            .await;

        log_summary(&job, started.elapsed().as_secs_f64());

        if let Err(err) = finalized {
            tracing::error!(job_id = %job_id, "Failed to finalize job: {}", err);
            return Err(err.into());
        }
        Ok(job)
    }

    async fn drive_chunks(
        &self,
        job_id: &str,
        work_items: &[i64],
        stage: StageId,
        batch_size: usize,
        tally: &mut Tally,
    ) -> RunExit {
        let stop = self.shutdown.child_token();
        let chunks: Vec<Vec<i64>> = work_items.chunks(batch_size).map(<[i64]>::to_vec).collect();
        let total_chunks = chunks.len();

        let mut outcomes = stream::iter(chunks.into_iter().enumerate())
            .take_while(|_| future::ready(!stop.is_cancelled()))
            .map(|(index, ids)| {
                let span = tracing::info_span!("chunk", index = index + 1, total = total_chunks);
                self.process_chunk(job_id, index, ids, stage, &stop)
                    .instrument(span)
            })
            .buffer_unordered(self.concurrency);

        let mut fatal = None;
        while let Some(mut outcome) = outcomes.next().await {
            tally.succeeded += outcome.succeeded;
            tally.failed += outcome.failed;
            tally.pending += outcome.pending;
            tally.skipped += outcome.skipped;
            tally.finished_chunks += 1;
            if let Some(err) = outcome.error.take() {
                tally.failed_chunks += 1;
                tally.last_error = Some(err);
            }

            if let Err(err) = self
                .ledger
                .record_chunk(job_id, &outcome.logs, tally.succeeded, tally.failed)
                .await
            {
                tracing::error!(chunk = outcome.index + 1, "Failed to write chunk ledger: {}", err);
                tally.failed_chunks += 1;
                tally.last_error = Some(format!("ledger write failed: {err}"));
            }

            if let Some(err) = outcome.fatal.take() {
                if fatal.is_none() {
                    tracing::error!("Completion capability unavailable; no further chunks will start");
                    stop.cancel();
                    fatal = Some(err);
                }
            }
        }

        match fatal {
            Some(err) => RunExit::Fatal(err),
            None if self.shutdown.is_cancelled() && tally.finished_chunks < total_chunks => {
                tracing::warn!(
                    finished = tally.finished_chunks,
                    total = total_chunks,
                    "Batch interrupted"
                );
                RunExit::Interrupted
            }
            None => RunExit::Completed,
        }
    }

    async fn process_chunk(
        &self,
        job_id: &str,
        index: usize,
        ids: Vec<i64>,
        stage: StageId,
        stop: &CancellationToken,
    ) -> ChunkOutcome {
        let started = Instant::now();
        tracing::info!(items = ids.len(), "Processing chunk");
        let result = self.analyse_chunk(job_id, index, &ids, stage, stop).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(analysis) => {
                let per_item = elapsed_ms / ids.len().max(1) as u64;
                let mut logs = Vec::with_capacity(ids.len());
                logs.extend(analysis.saved.iter().map(|(item_id, record_id)| BatchItemLog {
                    item_id: *item_id,
                    target_record_id: Some(record_id.clone()),
                    status: ItemStatus::Success,
                    duration_ms: per_item,
                    error_message: None,
                }));
                logs.extend(analysis.pending.iter().map(|item_id| BatchItemLog {
                    item_id: *item_id,
                    target_record_id: None,
                    status: ItemStatus::Pending,
                    duration_ms: per_item,
                    error_message: Some("no record returned; left for a future run".to_string()),
                }));
                logs.extend(analysis.skipped.iter().map(|item_id| BatchItemLog {
                    item_id: *item_id,
                    target_record_id: None,
                    status: ItemStatus::Skipped,
                    duration_ms: per_item,
                    error_message: Some("no dossier available".to_string()),
                }));
                tracing::info!(
                    succeeded = analysis.saved.len(),
                    pending = analysis.pending.len(),
                    skipped = analysis.skipped.len(),
                    elapsed_ms,
                    "Chunk processed"
                );
                ChunkOutcome {
                    index,
                    logs,
                    succeeded: analysis.saved.len(),
                    failed: 0,
                    pending: analysis.pending.len(),
                    skipped: analysis.skipped.len(),
                    error: None,
                    fatal: None,
                }
            }
            Err(err) => {
                tracing::error!(
                    class = err.class(),
                    elapsed_ms,
                    "Chunk failed: {}",
                    err
                );
                let message = truncate_chars(
                    &format!("{}: {}", err.class(), err),
                    self.error_message_max_len,
                );
                let logs = ids
                    .iter()
                    .map(|item_id| BatchItemLog {
                        item_id: *item_id,
                        target_record_id: None,
                        status: ItemStatus::BatchFailure,
                        duration_ms: elapsed_ms,
                        error_message: Some(message.clone()),
                    })
                    .collect();
                ChunkOutcome {
                    index,
                    logs,
                    succeeded: 0,
                    failed: ids.len(),
                    pending: 0,
                    skipped: 0,
                    error: Some(message),
                    fatal: err.is_fatal().then_some(err),
                }
            }
        }
    }

    async fn analyse_chunk(
        &self,
        job_id: &str,
        index: usize,
        ids: &[i64],
        stage: StageId,
        stop: &CancellationToken,
    ) -> Result<ChunkAnalysis, TriageError> {
        let dossiers = self.items.load_dossiers(ids).await?;
        if dossiers.is_empty() {
            return Err(TriageError::SchemaValidation(
                "no dossier could be generated for the chunk".to_string(),
            ));
        }
        let available: HashSet<i64> = dossiers.iter().map(|d| d.ticket_id).collect();
        let skipped: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !available.contains(id))
            .collect();

        let input = StageInput::Dossiers(dossiers.clone());
        let input_size = input
            .render()
            .map_err(|e| TriageError::SchemaValidation(format!("cannot serialise dossiers: {e}")))?
            .chars()
            .count();
        if input_size < self.min_input_chars {
            return Err(TriageError::SchemaValidation(format!(
                "dossier input too short for analysis ({input_size} chars)"
            )));
        }
        tracing::debug!(input_size, "Sending dossiers for analysis");

        let session = SessionContext::conversation(job_id, index as u64).with_metadata(json!({
            "job_id": job_id,
            "chunk": index,
            "tickets": ids,
            "input_size": input_size,
            "processing_version": 1,
        }));
        let result = self
            .invoker
            .execute(stage, &input, &session, &self.retry, Some(stop))
            .await?;

        let records = self.match_records(&result, &dossiers)?;

        let record_ids = self.sink.save_batch(&records).await?;
        if record_ids.len() != records.len() {
            return Err(TriageError::Persistence(format!(
                "record sink returned {} ids for {} records",
                record_ids.len(),
                records.len()
            )));
        }
        let processed: Vec<i64> = records.iter().map(|r| r.ticket_id).collect();
        self.items.mark_processed(&processed).await?;

        let matched: HashSet<i64> = processed.iter().copied().collect();
        let pending = dossiers
            .iter()
            .map(|d| d.ticket_id)
            .filter(|id| !matched.contains(id))
            .collect();

        Ok(ChunkAnalysis {
            saved: processed.into_iter().zip(record_ids).collect(),
            pending,
            skipped,
        })
    }

    /// 按 ticket_id 把记录对回本分块的卷宗；多出、重复或未知的记录使整块失败
    fn match_records(
        &self,
        result: &StageResult,
        dossiers: &[Dossier],
    ) -> Result<Vec<KnowledgeRecord>, TriageError> {
        let list = result
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| TriageError::SchemaValidation("response has no record list".into()))?;

        if list.is_empty() {
            return Err(TriageError::SchemaValidation(
                "stage returned an empty record list".into(),
            ));
        }
        if list.len() > dossiers.len() {
            return Err(TriageError::SchemaValidation(format!(
                "record count mismatch: {} dossiers in, {} records out",
                dossiers.len(),
                list.len()
            )));
        }

        let expected: HashMap<i64, usize> = dossiers
            .iter()
            .enumerate()
            .map(|(i, d)| (d.ticket_id, i))
            .collect();
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(list.len());
        for value in list {
            let mut record: KnowledgeRecord = serde_json::from_value(value.clone())
                .map_err(|e| TriageError::SchemaValidation(format!("invalid record: {e}")))?;
            if !expected.contains_key(&record.ticket_id) {
                return Err(TriageError::SchemaValidation(format!(
                    "record for ticket {} which is not in the chunk",
                    record.ticket_id
                )));
            }
            if !seen.insert(record.ticket_id) {
                return Err(TriageError::SchemaValidation(format!(
                    "duplicate record for ticket {}",
                    record.ticket_id
                )));
            }
            if record.ticket_level > 3 {
                return Err(TriageError::SchemaValidation(format!(
                    "ticket_level {} out of range for ticket {}",
                    record.ticket_level, record.ticket_id
                )));
            }
            if record.llm_model.is_none() {
                record.llm_model = Some(self.model_name.clone());
            }
            records.push(record);
        }
        records.sort_by_key(|r| expected.get(&r.ticket_id).copied().unwrap_or(usize::MAX));
        Ok(records)
    }
}

fn log_summary(job: &BatchJob, total_secs: f64) {
    tracing::info!(
        job_id = %job.job_id,
        status = %job.status,
        found = job.total_found,
        succeeded = job.succeeded_count,
        failed = job.failed_count,
        pending = job.pending_count,
        skipped = job.skipped_count,
        "Batch job finished"
    );
    tracing::info!(
        "Success rate {:.1}%, total time {:.1}s",
        job.success_rate(),
        total_secs
    );
    if job.succeeded_count > 0 {
        tracing::info!(
            "Average time per succeeded item {:.1}s",
            total_secs / job.succeeded_count as f64
        );
    }
    if let Some(summary) = &job.error_summary {
        tracing::warn!("Error summary: {}", summary);
    }
}
