use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    BufferUpdate,
    MaybeRespond,
    HistoryLink,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::BufferUpdate => write!(f, "BUFFER_UPDATE"),
            JobType::MaybeRespond => write!(f, "MAYBE_RESPOND"),
            JobType::HistoryLink => write!(f, "HISTORY_LINK"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "BUFFER_UPDATE" => Ok(JobType::BufferUpdate),
            "MAYBE_RESPOND" => Ok(JobType::MaybeRespond),
            "HISTORY_LINK" => Ok(JobType::HistoryLink),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// One queued unit of work. `payload` is opaque to the queue; the
/// dispatcher deserializes it per type. `job_key` groups jobs that a
/// producer may want to cancel together (e.g. the admin id behind a
/// pending HISTORY_LINK).
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub next_visible_at: i64,
    pub created_at: i64,
    pub job_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_round_trip() {
        for t in [JobType::BufferUpdate, JobType::MaybeRespond, JobType::HistoryLink] {
            let parsed: JobType = t.to_string().parse().unwrap();
            assert_eq!(parsed, t);
        }
    }

    #[test]
    fn job_status_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let parsed: JobStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}
