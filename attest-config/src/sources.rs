use std::{path::PathBuf, str::FromStr};

use attest_core::OrchestratorConfig;
use serde::{Deserialize, Serialize};

use crate::util::non_blank;

/// Raw configuration as written in `attest.toml` or an equivalent JSON
/// document.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub collaborators: FileCollaboratorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCollaboratorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_timeout_ms: Option<u64>,
}

fn parse<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|raw| raw.parse().ok())
}

/// Values read from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub instance: Option<String>,
    pub database_url: Option<String>,
    pub database_url_file: Option<PathBuf>,
    pub database_max_connections: Option<u32>,
    pub catalog_url: Option<String>,
    pub directory_url: Option<String>,
    pub engine_url: Option<String>,
    pub engine_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub max_publish_failures: Option<u32>,
    pub worker_max_in_flight: Option<usize>,
    pub worker_processing_timeout_ms: Option<u64>,
    pub runner_workers: Option<usize>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| non_blank(lookup(name));

        Self {
            config_path: var("ATTEST_CONFIG_PATH").map(PathBuf::from),
            config_json: var("ATTEST_CONFIG_JSON"),
            instance: var("ATTEST_INSTANCE"),
            database_url: var("DATABASE_URL"),
            database_url_file: var("DATABASE_URL_FILE").map(PathBuf::from),
            database_max_connections: parse(var("DATABASE_MAX_CONNECTIONS")),
            catalog_url: var("ATTEST_CATALOG_URL"),
            directory_url: var("ATTEST_DIRECTORY_URL"),
            engine_url: var("ATTEST_ENGINE_URL"),
            engine_timeout_ms: parse(var("ATTEST_ENGINE_TIMEOUT_MS")),
            max_retries: parse(var("ATTEST_MAX_RETRIES")),
            max_publish_failures: parse(var("ATTEST_MAX_PUBLISH_FAILURES")),
            worker_max_in_flight: parse(var("ATTEST_WORKER_MAX_IN_FLIGHT")),
            worker_processing_timeout_ms: parse(var("ATTEST_WORKER_PROCESSING_TIMEOUT_MS")),
            runner_workers: parse(var("ATTEST_RUNNER_WORKERS")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn lookup_parses_and_skips_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/attest"),
            ("ATTEST_MAX_RETRIES", "7"),
            ("ATTEST_WORKER_MAX_IN_FLIGHT", "many"),
            ("ATTEST_CATALOG_URL", "   "),
        ]);
        let env = EnvConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(env.database_url.as_deref(), Some("postgres://localhost/attest"));
        assert_eq!(env.max_retries, Some(7));
        assert_eq!(env.worker_max_in_flight, None);
        assert_eq!(env.catalog_url, None);
    }
}
