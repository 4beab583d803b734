//! 批处理数据模型：任务、条目日志、知识记录

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::StageId;

/// 任务类型（账本元数据）
pub const JOB_TYPE_KNOWLEDGE: &str = "knowledge";

/// 任务状态：RUNNING → COMPLETED | FAILED | INTERRUPTED，只能单向流转
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    /// 运维中断；账本上视为失败的终态
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Interrupted)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(self, JobStatus::Running) && next.is_terminal()
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "INTERRUPTED" => Some(JobStatus::Interrupted),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 创建任务时写入账本的参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewJob {
    pub total_found: usize,
    pub batch_size: usize,
    pub stage_id: StageId,
    pub job_type: String,
}

/// 一次批处理运行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub status: JobStatus,
    pub total_found: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
    /// 本次运行中未被匹配、留待下次运行的条目数
    pub pending_count: usize,
    pub skipped_count: usize,
    pub error_summary: Option<String>,
    pub batch_size: usize,
    pub stage_id: StageId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(job_id: impl Into<String>, job: &NewJob) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Running,
            total_found: job.total_found,
            succeeded_count: 0,
            failed_count: 0,
            pending_count: 0,
            skipped_count: 0,
            error_summary: None,
            batch_size: job.batch_size,
            stage_id: job.stage_id,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 成功率（百分比）；无已处理条目时为 0
    pub fn success_rate(&self) -> f64 {
        let done = self.succeeded_count + self.failed_count;
        if done == 0 {
            0.0
        } else {
            self.succeeded_count as f64 * 100.0 / done as f64
        }
    }
}

/// 条目处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Success,
    BatchFailure,
    Skipped,
    Pending,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "SUCCESS",
            ItemStatus::BatchFailure => "BATCH_FAILURE",
            ItemStatus::Skipped => "SKIPPED",
            ItemStatus::Pending => "PENDING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(ItemStatus::Success),
            "BATCH_FAILURE" => Some(ItemStatus::BatchFailure),
            "SKIPPED" => Some(ItemStatus::Skipped),
            "PENDING" => Some(ItemStatus::Pending),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 每个条目每次运行一条，写入后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemLog {
    pub item_id: i64,
    /// 仅成功时有值：写入的知识记录 ID
    pub target_record_id: Option<String>,
    pub status: ItemStatus,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

fn default_processing_version() -> u32 {
    1
}

/// 从已解决工单提炼的知识记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub ticket_id: i64,
    #[serde(default)]
    pub tfs_work_item_id: Option<i64>,
    pub title: String,
    pub problem_summary: String,
    pub root_cause_analysis: String,
    pub solution_applied: String,
    pub solution_type: String,
    #[serde(default)]
    pub sql_template: Vec<String>,
    pub tags: Vec<String>,
    /// 0 信息 / 1 指导 / 2 数据分析 / 3 高级配置
    pub ticket_level: u8,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default = "default_processing_version")]
    pub processing_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions_are_one_way() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Interrupted));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Interrupted.is_failure());
    }

    #[test]
    fn test_record_defaults() {
        let record: KnowledgeRecord = serde_json::from_value(json!({
            "ticket_id": 10,
            "title": "Blank visit report",
            "problem_summary": "Report shows no rows",
            "root_cause_analysis": "Visit date outside the period",
            "solution_applied": "Adjusted the visit date",
            "solution_type": "SQL Script",
            "tags": ["report", "visit"],
            "ticket_level": 2
        }))
        .unwrap();
        assert!(record.sql_template.is_empty());
        assert_eq!(record.processing_version, 1);
        assert_eq!(record.tfs_work_item_id, None);
    }

    #[test]
    fn test_item_status_strings() {
        for status in [
            ItemStatus::Success,
            ItemStatus::BatchFailure,
            ItemStatus::Skipped,
            ItemStatus::Pending,
        ] {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_value(ItemStatus::BatchFailure).unwrap(),
            json!("BATCH_FAILURE")
        );
    }
}
