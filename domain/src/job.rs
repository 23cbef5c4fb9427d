use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

///
/// A Job is one migration run over a root folder. It is created once, mutated only by the
/// orchestrator, and never deleted - it is the audit trail for a run.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub root_folder: String,
    pub total_files: i32,
    pub processed_files: i32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum JobStatus {
    Created = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl JobStatus {
    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(JobStatus::Created),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Completed),
            3 => Some(JobStatus::Failed),
            4 => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl Job {
    pub fn new(root_folder: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status: JobStatus::Created,
            root_folder,
            total_files: 0,
            processed_files: 0,
        }
    }
}

///
/// One source file tracked within a Job.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobFile {
    pub id: Uuid,
    pub job_id: Uuid,
    pub file_path: String,
    pub status: JobFileStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lines_read: i64,
    pub lines_inserted: i64,
    pub lines_rejected: i64,
    pub table_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum JobFileStatus {
    Pending = 0,
    Processing = 1,
    Completed = 2,
    Failed = 3,
}

impl JobFileStatus {
    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(JobFileStatus::Pending),
            1 => Some(JobFileStatus::Processing),
            2 => Some(JobFileStatus::Completed),
            3 => Some(JobFileStatus::Failed),
            _ => None,
        }
    }
}

impl JobFile {
    pub fn new_pending(job_id: Uuid, file_path: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            file_path,
            status: JobFileStatus::Pending,
            started_at: None,
            finished_at: None,
            lines_read: 0,
            lines_inserted: 0,
            lines_rejected: 0,
            table_name: None,
        }
    }
}

///
/// An append-only failure event. Survives its parent Job/JobFile's terminal state.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_file_id: Option<Uuid>,
    pub line_number: Option<i64>,
    pub column_name: Option<String>,
    pub error_type: JobErrorType,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum JobErrorType {
    StructuralFailure = 0,
    LineError = 1,
    ColumnError = 2,
    DatabaseError = 3,
    Other = 4,
}

impl JobErrorType {
    pub fn from_ordinal(ordinal: i32) -> Option<Self> {
        match ordinal {
            0 => Some(JobErrorType::StructuralFailure),
            1 => Some(JobErrorType::LineError),
            2 => Some(JobErrorType::ColumnError),
            3 => Some(JobErrorType::DatabaseError),
            4 => Some(JobErrorType::Other),
            _ => None,
        }
    }
}

impl JobError {
    pub fn new(job_id: Uuid, job_file_id: Option<Uuid>, error_type: JobErrorType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            job_file_id,
            line_number: None,
            column_name: None,
            error_type,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn at_line(mut self, line_number: i64) -> Self {
        self.line_number = Some(line_number);
        self
    }

    pub fn in_column(mut self, column_name: impl Into<String>) -> Self {
        self.column_name = Some(column_name.into());
        self
    }
}

///
/// One time-stamped measurement attached to a Job, e.g. `UtilizationPercentage`,
/// `TotalExecutionTime`, or `FileProcessingTime_<name>`.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobMetric {
    pub id: Uuid,
    pub job_id: Uuid,
    pub metric_name: String,
    pub metric_value: rust_decimal::Decimal,
    pub recorded_at: DateTime<Utc>,
}

impl JobMetric {
    pub fn new(job_id: Uuid, metric_name: impl Into<String>, metric_value: rust_decimal::Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            metric_name: metric_name.into(),
            metric_value,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_ordinals_round_trip() {
        for status in [JobStatus::Created, JobStatus::Running, JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert_eq!(Some(status), JobStatus::from_ordinal(status as i32));
        }
    }

    #[test]
    fn test_new_job_starts_created_with_zero_counters() {
        let job = Job::new("/data/inbox".into());
        assert_eq!(JobStatus::Created, job.status);
        assert_eq!(0, job.total_files);
        assert_eq!(0, job.processed_files);
    }
}
