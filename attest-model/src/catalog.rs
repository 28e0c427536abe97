//! Shapes returned by the query catalog and the connection directory.

use serde::{Deserialize, Serialize};

use crate::status::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// A policy query as stored in the catalog. The body is opaque to the
/// orchestrator and only interpreted by the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub id: String,
    #[serde(default)]
    pub connector: Option<Connector>,
    pub query_to_execute: String,
    #[serde(default)]
    pub engine: Option<String>,
    /// Global queries run once per job instead of once per connection.
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub list_of_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Manual policies have no query attached and never produce a runner.
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub severity: Severity,
}

/// Benchmarks form a tree: each node may reference child benchmarks and
/// policies. The same query can be reached through several paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub connector: Option<Connector>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Initial,
    Healthy,
    Unhealthy,
}

/// A cloud account known to the connection directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    /// Provider-side identifier (account id, subscription id).
    pub provider_connection_id: String,
    pub connector: Connector,
    #[serde(default)]
    pub health_state: HealthState,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl Connection {
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.health_state != HealthState::Unhealthy
    }
}
