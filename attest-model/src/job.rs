use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::Connection,
    error::{ModelError, Result},
    ids::JobId,
    status::{Connector, JobStatus, TriggerType},
};

/// Which connections a job evaluates.
///
/// An empty `connection_ids` list selects every runnable connection, narrowed
/// by `connector` when one is given.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobScope {
    #[serde(default)]
    pub connection_ids: Vec<String>,
    #[serde(default)]
    pub connector: Option<Connector>,
}

impl JobScope {
    pub fn new(
        connection_ids: impl IntoIterator<Item = String>,
        connector: Option<Connector>,
    ) -> Result<Self> {
        let mut connection_ids: Vec<String> = connection_ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .collect();
        if connection_ids.iter().any(String::is_empty) {
            return Err(ModelError::InvalidScope(
                "connection ids must not be blank".into(),
            ));
        }
        connection_ids.sort();
        connection_ids.dedup();
        Ok(Self {
            connection_ids,
            connector,
        })
    }

    pub fn includes(&self, connection: &Connection) -> bool {
        if let Some(connector) = self.connector
            && connection.connector != connector
        {
            return false;
        }
        self.connection_ids.is_empty()
            || self.connection_ids.binary_search(&connection.id).is_ok()
    }
}

/// Parent record of one benchmark evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceJob {
    pub id: JobId,
    pub benchmark_id: String,
    pub scope: JobScope,
    pub status: JobStatus,
    /// Set once every runner row for the job has been created. Fan-in never
    /// looks at a job before this flips.
    pub are_all_runners_queued: bool,
    pub trigger_type: TriggerType,
    pub external_request_id: Option<String>,
    pub total_finding_count: Option<i64>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ComplianceJob {
    pub fn new(
        benchmark_id: impl Into<String>,
        scope: JobScope,
        trigger_type: TriggerType,
        external_request_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            benchmark_id: benchmark_id.into(),
            scope,
            status: JobStatus::Created,
            are_all_runners_queued: false,
            trigger_type,
            external_request_id,
            total_finding_count: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::HealthState;

    fn connection(id: &str, connector: Connector) -> Connection {
        Connection {
            id: id.into(),
            provider_connection_id: format!("acct-{id}"),
            connector,
            health_state: HealthState::Healthy,
            enabled: true,
        }
    }

    #[test]
    fn scope_dedups_and_filters() {
        let scope = JobScope::new(
            ["c2".to_string(), "c1".to_string(), "c2".to_string()],
            Some(Connector::Aws),
        )
        .unwrap();
        assert_eq!(scope.connection_ids, vec!["c1", "c2"]);
        assert!(scope.includes(&connection("c1", Connector::Aws)));
        assert!(!scope.includes(&connection("c1", Connector::Azure)));
        assert!(!scope.includes(&connection("c3", Connector::Aws)));
    }

    #[test]
    fn empty_scope_selects_everything() {
        let scope = JobScope::default();
        assert!(scope.includes(&connection("any", Connector::Azure)));
    }

    #[test]
    fn blank_connection_id_is_rejected() {
        assert!(JobScope::new([" ".to_string()], None).is_err());
    }
}
