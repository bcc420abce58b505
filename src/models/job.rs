use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::Serialize;
use uuid::Uuid;

/// Serviced first.
pub const PRIORITY_HIGH: i32 = 1;
pub const PRIORITY_NORMAL: i32 = 2;
pub const PRIORITY_LOW: i32 = 3;

/// Job status as persisted in the `job_status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSql, FromSql)]
#[postgres(name = "job_status")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[postgres(name = "pending")]
    Pending,
    #[postgres(name = "processing")]
    Processing,
    #[postgres(name = "completed")]
    Completed,
    #[postgres(name = "failed")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// A request to produce (or refresh) the wrapped CEK for one binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncryptionJob {
    pub id: Uuid,
    pub material_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub license_id: Option<Uuid>,
    /// Lower is sooner.
    pub priority: i32,
    pub status: JobStatus,
    pub error: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EncryptionJob {
    pub fn new(
        material_id: Uuid,
        user_id: Uuid,
        device_id: Uuid,
        license_id: Option<Uuid>,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            material_id,
            user_id,
            device_id,
            license_id,
            priority,
            status: JobStatus::Pending,
            error: None,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    // The transitions below are the only places job state changes. Each one
    // returns false and leaves the job untouched when its precondition fails.

    /// pending -> processing
    pub(crate) fn begin(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        true
    }

    /// processing -> completed
    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        true
    }

    /// processing -> failed
    pub(crate) fn fail(&mut self, error: &str, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(now);
        true
    }

    /// failed -> pending, counting the retry
    pub(crate) fn reset_for_retry(&mut self) -> bool {
        if self.status != JobStatus::Failed {
            return false;
        }
        self.status = JobStatus::Pending;
        self.retry_count += 1;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        true
    }
}
