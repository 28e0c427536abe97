//! Finding-count alert rules.
//!
//! A rule is a tree of comparisons joined by `all`/`any`, evaluated against a
//! finished job's total finding count. Delivery of the resulting alerts is
//! left to an [`AlertSink`].

use std::fmt;

use async_trait::async_trait;
use attest_model::{ComplianceJob, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CompareOp {
    pub fn apply(self, observed: i64, threshold: i64) -> bool {
        match self {
            CompareOp::Gt => observed > threshold,
            CompareOp::Lt => observed < threshold,
            CompareOp::Ge => observed >= threshold,
            CompareOp::Le => observed <= threshold,
            CompareOp::Eq => observed == threshold,
            CompareOp::Ne => observed != threshold,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Compare { op: CompareOp, value: i64 },
    /// True when every child is true. Stops at the first false child.
    All { conditions: Vec<Condition> },
    /// True when some child is true. Stops at the first true child.
    Any { conditions: Vec<Condition> },
}

impl Condition {
    pub fn evaluate(&self, observed: i64) -> bool {
        match self {
            Condition::Compare { op, value } => op.apply(observed, *value),
            Condition::All { conditions } => {
                conditions.iter().all(|child| child.evaluate(observed))
            }
            Condition::Any { conditions } => {
                conditions.iter().any(|child| child.evaluate(observed))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    /// Restricts the rule to one benchmark; `None` applies to all.
    #[serde(default)]
    pub benchmark_id: Option<String>,
    pub condition: Condition,
}

impl AlertRule {
    pub fn matches(&self, job: &ComplianceJob, total_finding_count: i64) -> bool {
        if let Some(benchmark) = &self.benchmark_id
            && benchmark != &job.benchmark_id
        {
            return false;
        }
        self.condition.evaluate(total_finding_count)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAlert {
    pub rule: String,
    pub job_id: JobId,
    pub benchmark_id: String,
    pub total_finding_count: i64,
    pub raised_at: DateTime<Utc>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: JobAlert) -> Result<()>;
}

/// Emits alerts as structured log events.
#[derive(Debug, Clone, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: JobAlert) -> Result<()> {
        tracing::warn!(
            target: "compliance::alerts",
            rule = %alert.rule,
            job_id = %alert.job_id,
            benchmark_id = %alert.benchmark_id,
            total_finding_count = alert.total_finding_count,
            "alert rule matched"
        );
        Ok(())
    }
}

/// Keeps raised alerts in memory.
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: AsyncMutex<Vec<JobAlert>>,
}

impl RecordingAlertSink {
    pub async fn alerts(&self) -> Vec<JobAlert> {
        self.alerts.lock().await.clone()
    }
}

impl fmt::Debug for RecordingAlertSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingAlertSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn raise(&self, alert: JobAlert) -> Result<()> {
        self.alerts.lock().await.push(alert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(op: CompareOp, value: i64) -> Condition {
        Condition::Compare { op, value }
    }

    #[test]
    fn leaf_operators() {
        assert!(cmp(CompareOp::Gt, 3).evaluate(4));
        assert!(!cmp(CompareOp::Gt, 3).evaluate(3));
        assert!(cmp(CompareOp::Ge, 3).evaluate(3));
        assert!(cmp(CompareOp::Lt, 3).evaluate(2));
        assert!(cmp(CompareOp::Le, 3).evaluate(3));
        assert!(cmp(CompareOp::Eq, 0).evaluate(0));
        assert!(cmp(CompareOp::Ne, 0).evaluate(1));
    }

    #[test]
    fn composites_nest() {
        // 10 < x <= 20 or x == 0
        let tree = Condition::Any {
            conditions: vec![
                Condition::All {
                    conditions: vec![cmp(CompareOp::Gt, 10), cmp(CompareOp::Le, 20)],
                },
                cmp(CompareOp::Eq, 0),
            ],
        };
        assert!(tree.evaluate(0));
        assert!(tree.evaluate(15));
        assert!(!tree.evaluate(21));
        assert!(!tree.evaluate(5));
    }

    #[test]
    fn empty_composites() {
        assert!(Condition::All { conditions: vec![] }.evaluate(1));
        assert!(!Condition::Any { conditions: vec![] }.evaluate(1));
    }

    #[test]
    fn parses_tagged_json() {
        let raw = r#"{"kind":"all","conditions":[{"kind":"compare","op":">=","value":1}]}"#;
        let parsed: Condition = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            Condition::All {
                conditions: vec![cmp(CompareOp::Ge, 1)]
            }
        );
    }
}
