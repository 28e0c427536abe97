//! Fan-out of a job into runner rows.
//!
//! The benchmark tree is walked depth first. A query reachable through several
//! policies or sub-benchmarks yields a single runner per connection that
//! carries every caller path, so it is executed once.

use std::collections::{BTreeMap, HashMap, HashSet};

use attest_model::{Caller, ComplianceJob, Connection, QueryDefinition, RunnerRecord};

use super::catalog::QueryCatalog;
use crate::error::{ComplianceError, Result};

/// Queries of a benchmark tree with the caller paths that reference them.
pub async fn collect_query_callers(
    catalog: &dyn QueryCatalog,
    root_benchmark: &str,
) -> Result<BTreeMap<String, Vec<Caller>>> {
    let mut callers: BTreeMap<String, Vec<Caller>> = BTreeMap::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack: Vec<(String, Vec<String>)> =
        vec![(root_benchmark.to_string(), vec![root_benchmark.to_string()])];

    while let Some((benchmark_id, path)) = stack.pop() {
        if !visited.insert(benchmark_id.clone()) {
            continue;
        }
        let benchmark = catalog.get_benchmark(&benchmark_id).await?.ok_or_else(|| {
            ComplianceError::Resolution(format!("benchmark {benchmark_id} not found"))
        })?;

        for policy_id in &benchmark.policies {
            let policy = catalog.get_policy(policy_id).await?.ok_or_else(|| {
                ComplianceError::Resolution(format!(
                    "policy {policy_id} referenced by {benchmark_id} not found"
                ))
            })?;
            let Some(query_id) = policy.query_id else {
                continue;
            };
            callers.entry(query_id).or_default().push(Caller {
                root_benchmark: root_benchmark.to_string(),
                parent_benchmark_ids: path.clone(),
                policy_id: policy.id,
                severity: policy.severity,
            });
        }

        for child in benchmark.children.iter().rev() {
            let mut child_path = path.clone();
            child_path.push(child.clone());
            stack.push((child.clone(), child_path));
        }
    }

    Ok(callers)
}

/// Build the runner rows for `job`.
///
/// Global queries get one runner without a connection. Every other query gets
/// one runner per in-scope, runnable connection of a matching connector.
pub async fn expand_job(
    job: &ComplianceJob,
    catalog: &dyn QueryCatalog,
    queries: &HashMap<String, QueryDefinition>,
    connections: &[Connection],
) -> Result<Vec<RunnerRecord>> {
    let callers = collect_query_callers(catalog, &job.benchmark_id).await?;

    for requested in &job.scope.connection_ids {
        if !connections.iter().any(|connection| &connection.id == requested) {
            tracing::warn!(
                target: "compliance::publisher",
                job_id = %job.id,
                connection_id = %requested,
                "requested connection is unknown to the directory"
            );
        }
    }

    let in_scope: Vec<&Connection> = connections
        .iter()
        .filter(|connection| job.scope.includes(connection) && connection.is_runnable())
        .collect();

    let mut runners = Vec::new();
    for (query_id, query_callers) in callers {
        let query = queries.get(&query_id).ok_or_else(|| {
            ComplianceError::Resolution(format!("query {query_id} not found"))
        })?;

        if query.global {
            runners.push(RunnerRecord::new(job.id, &query_id, None, query_callers));
            continue;
        }

        for connection in &in_scope {
            if query
                .connector
                .is_some_and(|connector| connector != connection.connector)
            {
                continue;
            }
            runners.push(RunnerRecord::new(
                job.id,
                &query_id,
                Some(connection.id.clone()),
                query_callers.clone(),
            ));
        }
    }

    Ok(runners)
}
