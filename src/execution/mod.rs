//! Execution records: the runtime state of driving a committed route to
//! completion. STUCK is a detectable annotation on an in-flight execution,
//! not a stored status.

pub mod driver;

pub use driver::ExecutionDriver;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution lifecycle states. Severity is monotonically non-decreasing:
/// a terminal record never reverts to in-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Started,
    InProgress,
    Done,
    Failed,
}

impl ExecutionStatus {
    pub fn severity(&self) -> u8 {
        match self {
            ExecutionStatus::Started => 0,
            ExecutionStatus::InProgress => 1,
            ExecutionStatus::Done | ExecutionStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Done | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Started => "STARTED",
            ExecutionStatus::InProgress => "IN_PROGRESS",
            ExecutionStatus::Done => "DONE",
            ExecutionStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the deal the execution moves funds for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPurpose {
    Deposit,
    Release,
}

/// One entry of the status history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    pub at: DateTime<Utc>,
    pub detail: String,
}

/// Runtime record of driving a route. Owned by the deal that spawned it but
/// referenced by id only, so monitoring proceeds even when the deal record
/// is briefly unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    /// Persistence version for compare-and-swap writes
    pub version: u64,
    pub deal_id: Uuid,
    pub route_id: Uuid,
    pub purpose: ExecutionPurpose,
    pub status: ExecutionStatus,
    pub status_history: Vec<StatusUpdate>,
    pub retry_count: u32,
    /// Opaque handle from the provider; absent until the first begin succeeds
    pub provider_handle: Option<String>,
    /// True once the provider accepted a step: from here on a failure means
    /// "unknown outcome", never "nothing happened"
    pub funds_committed: bool,
    pub expected_duration_secs: u64,
    pub started_at: DateTime<Utc>,
    /// Earliest time the scheduler may retry; persisted so backoff survives
    /// a crash
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(
        deal_id: Uuid,
        route_id: Uuid,
        purpose: ExecutionPurpose,
        expected_duration_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 0,
            deal_id,
            route_id,
            purpose,
            status: ExecutionStatus::Started,
            status_history: vec![StatusUpdate {
                status: ExecutionStatus::Started,
                at: now,
                detail: "execution created".to_string(),
            }],
            retry_count: 0,
            provider_handle: None,
            funds_committed: false,
            expected_duration_secs,
            started_at: now,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// In flight past the expected duration scaled by the configured
    /// multiplier. An annotation, not a status: the record stays IN_PROGRESS.
    pub fn is_stuck(&self, now: DateTime<Utc>, multiplier: f64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let allowed_secs = (self.expected_duration_secs as f64 * multiplier).ceil() as i64;
        now > self.started_at + Duration::seconds(allowed_secs)
    }

    /// Append a history entry, deduplicated by (status, minute bucket) so
    /// frequent polling does not flood the audit trail. Returns whether an
    /// entry was appended.
    pub fn push_status(
        &mut self,
        status: ExecutionStatus,
        at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> bool {
        let bucket = at.timestamp() / 60;
        let duplicate = self
            .status_history
            .last()
            .map(|last| last.status == status && last.at.timestamp() / 60 == bucket)
            .unwrap_or(false);
        if duplicate {
            return false;
        }
        self.status_history.push(StatusUpdate {
            status,
            at,
            detail: detail.into(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(expected_secs: u64) -> Execution {
        Execution::new(Uuid::new_v4(), Uuid::new_v4(), ExecutionPurpose::Deposit, expected_secs)
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ExecutionStatus::Started.severity() < ExecutionStatus::InProgress.severity());
        assert!(ExecutionStatus::InProgress.severity() < ExecutionStatus::Done.severity());
        assert_eq!(
            ExecutionStatus::Done.severity(),
            ExecutionStatus::Failed.severity()
        );
    }

    #[test]
    fn test_stuck_detection() {
        let mut exec = execution(600);
        exec.status = ExecutionStatus::InProgress;

        let not_yet = exec.started_at + Duration::seconds(600);
        assert!(!exec.is_stuck(not_yet, 1.5));

        let past = exec.started_at + Duration::seconds(901);
        assert!(exec.is_stuck(past, 1.5));

        // Terminal records are never stuck
        exec.status = ExecutionStatus::Done;
        assert!(!exec.is_stuck(past, 1.5));
    }

    #[test]
    fn test_history_dedup_by_minute_bucket() {
        let mut exec = execution(600);
        let at = Utc::now();

        assert!(exec.push_status(ExecutionStatus::InProgress, at, "step 1"));
        // Same status, same minute: dropped
        assert!(!exec.push_status(ExecutionStatus::InProgress, at, "step 1 again"));
        // Same status, next minute: kept
        assert!(exec.push_status(
            ExecutionStatus::InProgress,
            at + Duration::seconds(61),
            "still going"
        ));
        // Distinct status in the same minute: kept
        assert!(exec.push_status(ExecutionStatus::Done, at + Duration::seconds(61), "done"));
        assert_eq!(exec.status_history.len(), 4);
    }
}
