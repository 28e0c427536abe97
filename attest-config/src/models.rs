use std::{path::PathBuf, time::Duration};

use attest_core::OrchestratorConfig;
use serde::Serialize;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ENGINE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_INSTANCE: &str = "attest";

/// Fully resolved configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Prefix for worker ids and log fields; distinguishes processes.
    pub instance: String,
    pub database: DatabaseConfig,
    pub collaborators: CollaboratorConfig,
    pub orchestrator: OrchestratorConfig,
    #[serde(skip)]
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Base URLs of the external catalog, connection directory and query engine.
#[derive(Debug, Clone, Serialize)]
pub struct CollaboratorConfig {
    pub catalog_url: Option<String>,
    pub directory_url: Option<String>,
    pub engine_url: Option<String>,
    pub engine_timeout_ms: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            catalog_url: None,
            directory_url: None,
            engine_url: None,
            engine_timeout_ms: DEFAULT_ENGINE_TIMEOUT_MS,
        }
    }
}

impl CollaboratorConfig {
    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }
}

/// Where the file-level configuration came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    #[default]
    Defaults,
    File(PathBuf),
    EnvInline,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub source: ConfigSource,
    pub env_file_loaded: bool,
}
