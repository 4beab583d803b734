//! SQLite 实现：工单源、知识库、任务账本共用一个数据库文件
//!
//! 每次操作在 spawn_blocking 中新开连接；分块写入（日志 + 计数）在同一事务内完成。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::batch::{
    BatchItemLog, BatchJob, ItemStatus, JobLedger, JobStatus, KnowledgeRecord, NewJob,
    RecordSink, StoreError, WorkItemSource,
};
use crate::stage::{Dossier, StageId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tickets (
    id INTEGER PRIMARY KEY,
    dossier TEXT,
    processed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS knowledge_base (
    id TEXT PRIMARY KEY,
    ticket_id INTEGER NOT NULL UNIQUE,
    tfs_work_item_id INTEGER,
    title TEXT NOT NULL,
    problem_summary TEXT NOT NULL,
    root_cause_analysis TEXT NOT NULL,
    solution_applied TEXT NOT NULL,
    solution_type TEXT NOT NULL,
    sql_template TEXT NOT NULL,
    tags TEXT NOT NULL,
    ticket_level INTEGER NOT NULL,
    llm_model TEXT,
    processing_version INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_jobs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    job_type TEXT NOT NULL,
    stage_id TEXT NOT NULL,
    batch_size INTEGER NOT NULL,
    total_found INTEGER NOT NULL,
    succeeded INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    error_summary TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS batch_item_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES batch_jobs(id),
    item_id INTEGER NOT NULL,
    target_record_id TEXT,
    status TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    error_message TEXT
);
";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// 打开数据库并确保表结构存在
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        store
            .blocking(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(path: &Path) -> Result<Connection, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::connect(&path)?;
            f(&mut conn)
        })
        .await?
    }

    /// 写入一张待处理工单（种子数据 / 测试用）
    pub async fn insert_ticket(&self, id: i64, dossier: Option<&str>) -> Result<(), StoreError> {
        let dossier = dossier.map(str::to_string);
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO tickets (id, dossier, processed) VALUES (?1, ?2, 0)
                 ON CONFLICT(id) DO UPDATE SET dossier = excluded.dossier",
                params![id, dossier],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<BatchJob>, StoreError> {
        let job_id = job_id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, status, stage_id, batch_size, total_found, succeeded, failed,
                        error_summary, started_at, finished_at
                 FROM batch_jobs WHERE id = ?1",
                params![job_id],
                |row| {
                    let status: String = row.get(1)?;
                    let stage: String = row.get(2)?;
                    let batch_size: i64 = row.get(3)?;
                    let total_found: i64 = row.get(4)?;
                    let succeeded: i64 = row.get(5)?;
                    let failed: i64 = row.get(6)?;
                    Ok(BatchJob {
                        job_id: row.get(0)?,
                        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
                        total_found: total_found as usize,
                        succeeded_count: succeeded as usize,
                        failed_count: failed as usize,
                        pending_count: 0,
                        skipped_count: 0,
                        error_summary: row.get(7)?,
                        batch_size: batch_size as usize,
                        stage_id: stage.parse().unwrap_or(StageId::KnowledgeBuilder),
                        started_at: row.get(8)?,
                        finished_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    pub async fn logs_for(&self, job_id: &str) -> Result<Vec<BatchItemLog>, StoreError> {
        let job_id = job_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, target_record_id, status, duration_ms, error_message
                 FROM batch_item_logs WHERE job_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![job_id], |row| {
                let status: String = row.get(2)?;
                let duration: i64 = row.get(3)?;
                Ok(BatchItemLog {
                    item_id: row.get(0)?,
                    target_record_id: row.get(1)?,
                    status: ItemStatus::parse(&status).unwrap_or(ItemStatus::BatchFailure),
                    duration_ms: duration.max(0) as u64,
                    error_message: row.get(4)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
        })
        .await
    }

    pub async fn knowledge_count(&self) -> Result<usize, StoreError> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge_base", [], |r| r.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

fn insert_logs(
    tx: &rusqlite::Transaction<'_>,
    job_id: &str,
    logs: &[BatchItemLog],
) -> Result<(), StoreError> {
    let mut stmt = tx.prepare(
        "INSERT INTO batch_item_logs
            (job_id, item_id, target_record_id, status, duration_ms, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for log in logs {
        stmt.execute(params![
            job_id,
            log.item_id,
            log.target_record_id,
            log.status.as_str(),
            log.duration_ms as i64,
            log.error_message,
        ])?;
    }
    Ok(())
}

fn update_counts(
    tx: &rusqlite::Transaction<'_>,
    job_id: &str,
    succeeded: usize,
    failed: usize,
) -> Result<(), StoreError> {
    let changed = tx.execute(
        "UPDATE batch_jobs SET succeeded = ?2, failed = ?3 WHERE id = ?1 AND status = 'RUNNING'",
        params![job_id, succeeded as i64, failed as i64],
    )?;
    if changed == 0 {
        return Err(StoreError::UnknownJob(job_id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl WorkItemSource for SqliteStore {
    async fn fetch_unprocessed(&self, limit: Option<usize>) -> Result<Vec<i64>, StoreError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM tickets WHERE processed = 0 ORDER BY id LIMIT ?1")?;
            let ids = stmt.query_map(params![limit], |row| row.get(0))?;
            ids.collect::<Result<Vec<i64>, _>>().map_err(StoreError::from)
        })
        .await
    }

    async fn load_dossiers(&self, ids: &[i64]) -> Result<Vec<Dossier>, StoreError> {
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT dossier FROM tickets WHERE id = ?1")?;
            let mut dossiers = Vec::with_capacity(ids.len());
            for id in ids {
                let text: Option<Option<String>> =
                    stmt.query_row(params![id], |row| row.get(0)).optional()?;
                if let Some(dossier) = text.flatten().filter(|d| !d.trim().is_empty()) {
                    dossiers.push(Dossier {
                        ticket_id: id,
                        dossier,
                    });
                }
            }
            Ok(dossiers)
        })
        .await
    }

    async fn mark_processed(&self, ids: &[i64]) -> Result<(), StoreError> {
        let ids = ids.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE tickets SET processed = 1 WHERE id = ?1")?;
                for id in ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RecordSink for SqliteStore {
    async fn save_batch(&self, records: &[KnowledgeRecord]) -> Result<Vec<String>, StoreError> {
        let records = records.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(records.len());
            {
                let mut upsert = tx.prepare(
                    "INSERT INTO knowledge_base
                        (id, ticket_id, tfs_work_item_id, title, problem_summary,
                         root_cause_analysis, solution_applied, solution_type, sql_template,
                         tags, ticket_level, llm_model, processing_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(ticket_id) DO UPDATE SET
                        tfs_work_item_id = excluded.tfs_work_item_id,
                        title = excluded.title,
                        problem_summary = excluded.problem_summary,
                        root_cause_analysis = excluded.root_cause_analysis,
                        solution_applied = excluded.solution_applied,
                        solution_type = excluded.solution_type,
                        sql_template = excluded.sql_template,
                        tags = excluded.tags,
                        ticket_level = excluded.ticket_level,
                        llm_model = excluded.llm_model,
                        processing_version = excluded.processing_version",
                )?;
                let mut lookup = tx.prepare("SELECT id FROM knowledge_base WHERE ticket_id = ?1")?;
                for record in &records {
                    let sql_template = serde_json::to_string(&record.sql_template)
                        .map_err(|e| StoreError::Database(e.to_string()))?;
                    let tags = serde_json::to_string(&record.tags)
                        .map_err(|e| StoreError::Database(e.to_string()))?;
                    upsert.execute(params![
                        Uuid::new_v4().to_string(),
                        record.ticket_id,
                        record.tfs_work_item_id,
                        record.title,
                        record.problem_summary,
                        record.root_cause_analysis,
                        record.solution_applied,
                        record.solution_type,
                        sql_template,
                        tags,
                        record.ticket_level,
                        record.llm_model,
                        record.processing_version,
                        Utc::now(),
                    ])?;
                    let id: String = lookup.query_row(params![record.ticket_id], |r| r.get(0))?;
                    ids.push(id);
                }
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl JobLedger for SqliteStore {
    async fn create_job(&self, job: &NewJob) -> Result<String, StoreError> {
        let job = job.clone();
        self.blocking(move |conn| {
            let job_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO batch_jobs
                    (id, status, job_type, stage_id, batch_size, total_found, started_at)
                 VALUES (?1, 'RUNNING', ?2, ?3, ?4, ?5, ?6)",
                params![
                    job_id,
                    job.job_type,
                    job.stage_id.name(),
                    job.batch_size as i64,
                    job.total_found as i64,
                    Utc::now(),
                ],
            )?;
            Ok(job_id)
        })
        .await
    }

    async fn append_item_logs(
        &self,
        job_id: &str,
        logs: &[BatchItemLog],
    ) -> Result<(), StoreError> {
        let job_id = job_id.to_string();
        let logs = logs.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            insert_logs(&tx, &job_id, &logs)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_progress(
        &self,
        job_id: &str,
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        let job_id = job_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            update_counts(&tx, &job_id, succeeded, failed)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        succeeded: usize,
        failed: usize,
        error_summary: Option<&str>,
    ) -> Result<(), StoreError> {
        let job_id = job_id.to_string();
        let error_summary = error_summary.map(str::to_string);
        self.blocking(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM batch_jobs WHERE id = ?1",
                    params![job_id],
                    |r| r.get(0),
                )
                .optional()?;
            let from = current
                .as_deref()
                .and_then(JobStatus::parse)
                .ok_or_else(|| StoreError::UnknownJob(job_id.clone()))?;
            if !from.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    job_id,
                    from,
                    to: status,
                });
            }
            conn.execute(
                "UPDATE batch_jobs
                 SET status = ?2, succeeded = ?3, failed = ?4, error_summary = ?5, finished_at = ?6
                 WHERE id = ?1",
                params![
                    job_id,
                    status.as_str(),
                    succeeded as i64,
                    failed as i64,
                    error_summary,
                    Utc::now(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_chunk(
        &self,
        job_id: &str,
        logs: &[BatchItemLog],
        succeeded: usize,
        failed: usize,
    ) -> Result<(), StoreError> {
        let job_id = job_id.to_string();
        let logs = logs.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            update_counts(&tx, &job_id, succeeded, failed)?;
            insert_logs(&tx, &job_id, &logs)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ticket_id: i64, title: &str) -> KnowledgeRecord {
        KnowledgeRecord {
            ticket_id,
            tfs_work_item_id: Some(900 + ticket_id),
            title: title.into(),
            problem_summary: "p".into(),
            root_cause_analysis: "r".into(),
            solution_applied: "s".into(),
            solution_type: "SQL Script".into(),
            sql_template: vec!["UPDATE visits SET date = :date WHERE id = :id".into()],
            tags: vec!["visit".into()],
            ticket_level: 2,
            llm_model: Some("gpt-4o-mini".into()),
            processing_version: 1,
        }
    }

    #[tokio::test]
    async fn test_tickets_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db")).await.unwrap();
        store.insert_ticket(1, Some("dossier one")).await.unwrap();
        store.insert_ticket(2, None).await.unwrap();
        store.insert_ticket(3, Some("dossier three")).await.unwrap();

        assert_eq!(store.fetch_unprocessed(Some(2)).await.unwrap(), vec![1, 2]);
        let dossiers = store.load_dossiers(&[1, 2, 3]).await.unwrap();
        assert_eq!(
            dossiers.iter().map(|d| d.ticket_id).collect::<Vec<_>>(),
            vec![1, 3]
        );

        store.mark_processed(&[1]).await.unwrap();
        assert_eq!(store.fetch_unprocessed(None).await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_save_batch_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("k.db")).await.unwrap();
        let first = store.save_batch(&[record(1, "first")]).await.unwrap();
        let second = store.save_batch(&[record(1, "second")]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.knowledge_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("j.db")).await.unwrap();
        let job_id = store
            .create_job(&NewJob {
                total_found: 2,
                batch_size: 1,
                stage_id: StageId::KnowledgeBuilder,
                job_type: "knowledge".into(),
            })
            .await
            .unwrap();
        store
            .record_chunk(
                &job_id,
                &[BatchItemLog {
                    item_id: 1,
                    target_record_id: None,
                    status: ItemStatus::BatchFailure,
                    duration_ms: 12,
                    error_message: Some("timeout".into()),
                }],
                0,
                1,
            )
            .await
            .unwrap();
        store
            .finalize_job(&job_id, JobStatus::Failed, 0, 1, Some("1 chunk failed"))
            .await
            .unwrap();
        assert!(store
            .finalize_job(&job_id, JobStatus::Completed, 0, 1, None)
            .await
            .is_err());

        let job = store.job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_count, 1);
        assert_eq!(job.error_summary.as_deref(), Some("1 chunk failed"));
        assert!(job.finished_at.is_some());

        let logs = store.logs_for(&job_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ItemStatus::BatchFailure);
    }
}
