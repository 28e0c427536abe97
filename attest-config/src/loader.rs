use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    models::{
        CollaboratorConfig, Config, ConfigMetadata, ConfigSource, DEFAULT_ENGINE_TIMEOUT_MS,
        DEFAULT_INSTANCE, DEFAULT_MAX_CONNECTIONS, DatabaseConfig,
    },
    sources::{EnvConfig, FileConfig, FileDatabaseConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 3] =
    ["attest.toml", "config/attest.toml", "config/attest.json"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Skip `.env` handling entirely.
    pub skip_env_file: bool,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

/// Resolved configuration plus the warnings collected while building it.
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.options.skip_env_file = true;
        self
    }

    /// Load `.env`, then compose from the process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        self.load_from_env(EnvConfig::gather(), env_file_loaded)
    }

    /// Compose from an explicit environment snapshot.
    pub fn load_from_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();
        let (file, source) = self.load_file_config(&env)?;
        if source == ConfigSource::Defaults {
            warnings.push_with_hint(
                "No attest.toml detected; using defaults and environment variables",
                "Set ATTEST_CONFIG_PATH or ATTEST_CONFIG_JSON to tune the orchestrator",
            );
        }

        let config = compose(file, env, source, env_file_loaded)?;
        warnings.extend(validation::apply_guard_rails(&config)?);
        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        if self.options.skip_env_file {
            return Ok(false);
        }
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        match loaded {
            Ok(loaded) => Ok(loaded),
            Err(dotenvy::Error::Io(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(FileConfig, ConfigSource), ConfigLoadError> {
        if let Some(path) = self.options.config_path.as_ref().or(env.config_path.as_ref()) {
            if !path.exists() {
                return Err(ConfigLoadError::MissingConfig { path: path.clone() });
            }
            return Ok((read_file_config(path)?, ConfigSource::File(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let file = serde_json::from_str(raw).map_err(ConfigLoadError::InlineJson)?;
            return Ok((file, ConfigSource::EnvInline));
        }

        match DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists())
        {
            Some(path) => Ok((read_file_config(&path)?, ConfigSource::File(path))),
            None => Ok((FileConfig::default(), ConfigSource::Defaults)),
        }
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&contents).map_err(|source| ConfigLoadError::ParseJson {
            path: path.to_path_buf(),
            source,
        })
    } else {
        toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn compose(
    file: FileConfig,
    env: EnvConfig,
    source: ConfigSource,
    env_file_loaded: bool,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        instance: file_instance,
        database: file_database,
        collaborators: file_collaborators,
        orchestrator: mut orchestrator,
    } = file;

    let database = DatabaseConfig {
        url: resolve_database_url(&env, &file_database)?,
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS),
    };

    let collaborators = CollaboratorConfig {
        catalog_url: env.catalog_url.or(file_collaborators.catalog_url),
        directory_url: env.directory_url.or(file_collaborators.directory_url),
        engine_url: env.engine_url.or(file_collaborators.engine_url),
        engine_timeout_ms: env
            .engine_timeout_ms
            .or(file_collaborators.engine_timeout_ms)
            .unwrap_or(DEFAULT_ENGINE_TIMEOUT_MS),
    };

    if let Some(max_retries) = env.max_retries {
        orchestrator.retry.max_retries = max_retries;
    }
    if let Some(max_publish_failures) = env.max_publish_failures {
        orchestrator.retry.max_publish_failures = max_publish_failures;
    }
    if let Some(max_in_flight) = env.worker_max_in_flight {
        orchestrator.worker.max_in_flight = max_in_flight;
    }
    if let Some(timeout_ms) = env.worker_processing_timeout_ms {
        orchestrator.worker.processing_timeout_ms = timeout_ms;
    }
    if let Some(runner_workers) = env.runner_workers {
        orchestrator.worker.runner_workers = runner_workers;
    }

    Ok(Config {
        instance: env
            .instance
            .or(file_instance)
            .unwrap_or_else(|| DEFAULT_INSTANCE.to_string()),
        database,
        collaborators,
        orchestrator,
        metadata: ConfigMetadata {
            source,
            env_file_loaded,
        },
    })
}

fn resolve_database_url(
    env: &EnvConfig,
    file_database: &FileDatabaseConfig,
) -> Result<Option<String>, ConfigLoadError> {
    if let Some(url) = env.database_url.clone() {
        return Ok(Some(url));
    }
    for path in [env.database_url_file.as_ref(), file_database.url_file.as_ref()]
        .into_iter()
        .flatten()
    {
        if let Some(url) = read_secret_file(path)? {
            return Ok(Some(url));
        }
    }
    Ok(file_database
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string))
}

fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::SecretFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse configuration {path}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse ATTEST_CONFIG_JSON")]
    InlineJson(#[source] serde_json::Error),
    #[error("failed to read secret file {path}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
