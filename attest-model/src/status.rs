//! Status vocabularies for jobs, runners and summarizers.
//!
//! Statuses are stored as upper-snake strings so the set-based repository
//! queries can filter on them directly.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lifecycle of a parent compliance job.
///
/// Status only moves forward along [`JobStatus::rank`]; `Succeeded`, `Failed`
/// and `TimedOut` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    RunnersInProgress,
    SinkInProgress,
    SummarizerInProgress,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 4] = [
        JobStatus::Created,
        JobStatus::RunnersInProgress,
        JobStatus::SinkInProgress,
        JobStatus::SummarizerInProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::RunnersInProgress => "RUNNERS_IN_PROGRESS",
            JobStatus::SinkInProgress => "SINK_IN_PROGRESS",
            JobStatus::SummarizerInProgress => "SUMMARIZER_IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Position in the forward-only ordering. Terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::RunnersInProgress => 1,
            JobStatus::SinkInProgress => 2,
            JobStatus::SummarizerInProgress => 3,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut => 4,
        }
    }

    /// Whether moving from `self` to `next` respects the job state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobStatus::TimedOut {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobStatus::Created),
            "RUNNERS_IN_PROGRESS" => Ok(JobStatus::RunnersInProgress),
            "SINK_IN_PROGRESS" => Ok(JobStatus::SinkInProgress),
            "SUMMARIZER_IN_PROGRESS" => Ok(JobStatus::SummarizerInProgress),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "TIMED_OUT" => Ok(JobStatus::TimedOut),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Lifecycle shared by runners and summarizers.
///
/// `Failed -> Created` is only taken by the bounded retry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    Created,
    Queued,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Created => "CREATED",
            RunnerStatus::Queued => "QUEUED",
            RunnerStatus::InProgress => "IN_PROGRESS",
            RunnerStatus::Succeeded => "SUCCEEDED",
            RunnerStatus::Failed => "FAILED",
            RunnerStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerStatus::Succeeded | RunnerStatus::Failed | RunnerStatus::TimedOut
        )
    }

    /// A unit is done once it will never be executed again.
    ///
    /// `Failed` only counts as done when its retry budget is spent, or when
    /// its publish-failure budget is spent.
    pub fn is_done(
        &self,
        retry_count: u32,
        publish_failures: u32,
        max_retries: u32,
        max_publish_failures: u32,
    ) -> bool {
        match self {
            RunnerStatus::Succeeded | RunnerStatus::TimedOut => true,
            RunnerStatus::Failed => {
                retry_count >= max_retries
                    || publish_failures >= max_publish_failures
            }
            _ => false,
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(RunnerStatus::Created),
            "QUEUED" => Ok(RunnerStatus::Queued),
            "IN_PROGRESS" => Ok(RunnerStatus::InProgress),
            "SUCCEEDED" => Ok(RunnerStatus::Succeeded),
            "FAILED" => Ok(RunnerStatus::Failed),
            "TIMED_OUT" => Ok(RunnerStatus::TimedOut),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// How a job came to exist. Manual jobs are reconciled ahead of scheduled ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "SCHEDULED",
            TriggerType::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(TriggerType::Scheduled),
            "MANUAL" => Ok(TriggerType::Manual),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Cloud provider family a query or connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Connector {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "Azure")]
    Azure,
}

impl Connector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connector::Aws => "AWS",
            Connector::Azure => "Azure",
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Connector {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Connector::Aws),
            "azure" => Ok(Connector::Azure),
            _ => Err(ModelError::UnknownConnector(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_job_states_are_absorbing() {
        for terminal in [JobStatus::Succeeded, JobStatus::Failed, JobStatus::TimedOut] {
            for next in JobStatus::NON_TERMINAL {
                assert!(!terminal.can_transition_to(next));
            }
            assert!(!terminal.can_transition_to(JobStatus::TimedOut));
        }
    }

    #[test]
    fn job_status_only_moves_forward() {
        assert!(JobStatus::Created.can_transition_to(JobStatus::RunnersInProgress));
        assert!(
            JobStatus::RunnersInProgress
                .can_transition_to(JobStatus::SummarizerInProgress)
        );
        assert!(
            !JobStatus::SummarizerInProgress
                .can_transition_to(JobStatus::RunnersInProgress)
        );
        assert!(JobStatus::SummarizerInProgress.can_transition_to(JobStatus::TimedOut));
    }

    #[test]
    fn failed_runner_is_done_only_once_budget_is_spent() {
        let failed = RunnerStatus::Failed;
        assert!(!failed.is_done(2, 0, 3, 3));
        assert!(failed.is_done(3, 0, 3, 3));
        assert!(failed.is_done(0, 3, 3, 3));
        assert!(RunnerStatus::TimedOut.is_done(0, 0, 3, 3));
        assert!(!RunnerStatus::Queued.is_done(5, 5, 3, 3));
    }

    #[test]
    fn statuses_round_trip_through_storage_strings() {
        for status in [
            RunnerStatus::Created,
            RunnerStatus::Queued,
            RunnerStatus::InProgress,
            RunnerStatus::Succeeded,
            RunnerStatus::Failed,
            RunnerStatus::TimedOut,
        ] {
            assert_eq!(status.as_str().parse::<RunnerStatus>().unwrap(), status);
        }
        assert!("PAUSED".parse::<JobStatus>().is_err());
    }
}
