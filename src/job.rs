use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::utils::BoxFuture;

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    EnRoute,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    /// Statuses during which live tracking and routing are active.
    pub fn is_en_route_eligible(&self) -> bool {
        matches!(
            self,
            JobStatus::Assigned | JobStatus::EnRoute | JobStatus::Arrived
        )
    }

    /// A session must stop once the job reaches one of these.
    pub fn ends_tracking(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

/// What the job service tells us about a job the current technician wants to
/// track.
#[derive(Clone, Debug, PartialEq)]
pub struct JobGrant {
    pub job_id: String,
    pub status: JobStatus,
    /// Whether the signed-in technician is assigned to this job.
    pub owned: bool,
}

/// Job/Auth collaborator. The tracker never sends updates for a job that
/// this does not grant.
pub trait JobDirectory: Send + Sync {
    fn lookup(&self, job_id: &str) -> BoxFuture<anyhow::Result<Option<JobGrant>>>;
}
