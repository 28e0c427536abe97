use std::collections::HashSet;

use attest_core::orchestration::config::MAX_AGE_SECS;
use thiserror::Error;
use url::Url;

use crate::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("queue topic {field} must not be empty")]
    EmptyTopic { field: &'static str },
    #[error("queue topic `{topic}` is used for more than one channel")]
    SharedTopic { topic: String },
    #[error("{field} must not exceed {max} seconds")]
    AgeTooLarge { field: &'static str, max: u64 },
    #[error("{field} is not a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let orchestrator = &config.orchestrator;

    for (field, value) in [
        ("publisher.batch_size", orchestrator.publisher.batch_size),
        (
            "publisher.max_batches_per_cycle",
            orchestrator.publisher.max_batches_per_cycle,
        ),
        ("worker.max_in_flight", orchestrator.worker.max_in_flight),
    ] {
        if value == 0 {
            return Err(ConfigGuardRailError::ZeroValue { field });
        }
    }
    if orchestrator.worker.processing_timeout_ms == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            field: "worker.processing_timeout_ms",
        });
    }

    for (field, value) in [
        ("timeouts.queued_secs", orchestrator.timeouts.queued_secs),
        ("timeouts.in_progress_secs", orchestrator.timeouts.in_progress_secs),
        ("timeouts.job_secs", orchestrator.timeouts.job_secs),
        ("retention.max_age_secs", orchestrator.retention.max_age_secs),
    ] {
        if value > MAX_AGE_SECS {
            return Err(ConfigGuardRailError::AgeTooLarge {
                field,
                max: MAX_AGE_SECS,
            });
        }
    }

    let queue = &orchestrator.queue;
    let mut seen = HashSet::new();
    for (field, topic) in [
        ("queue.runner_topic", &queue.runner_topic),
        ("queue.runner_result_topic", &queue.runner_result_topic),
        ("queue.summarizer_topic", &queue.summarizer_topic),
        ("queue.summarizer_result_topic", &queue.summarizer_result_topic),
    ] {
        if topic.trim().is_empty() {
            return Err(ConfigGuardRailError::EmptyTopic { field });
        }
        if !seen.insert(topic.as_str()) {
            return Err(ConfigGuardRailError::SharedTopic {
                topic: topic.clone(),
            });
        }
    }

    let collaborators = &config.collaborators;
    for (field, value) in [
        ("ATTEST_CATALOG_URL", &collaborators.catalog_url),
        ("ATTEST_DIRECTORY_URL", &collaborators.directory_url),
        ("ATTEST_ENGINE_URL", &collaborators.engine_url),
    ] {
        if let Some(value) = value
            && Url::parse(value).is_err()
        {
            return Err(ConfigGuardRailError::InvalidUrl {
                field,
                value: value.clone(),
            });
        }
    }

    let in_progress_ms = orchestrator.timeouts.in_progress_secs.saturating_mul(1_000);
    if in_progress_ms < orchestrator.worker.processing_timeout_ms {
        warnings.push_with_hint(
            "in-progress timeout is shorter than the worker processing deadline",
            "Runners still executing will be timed out; raise timeouts.in_progress_secs",
        );
    }

    if queue.visibility_timeout_ms < orchestrator.worker.processing_timeout_ms {
        warnings.push_with_hint(
            "queue visibility timeout is shorter than the worker processing deadline",
            "Slow runner jobs will be redelivered while still executing",
        );
    }

    if orchestrator.retry.max_retries == 0 {
        warnings.push("retry.max_retries is 0; a single failure permanently fails a runner");
    }

    if config.database.url.is_none() {
        warnings.push_with_hint(
            "DATABASE_URL not configured; only in-memory operation is possible",
            "Set DATABASE_URL or database.url in the configuration file",
        );
    }

    if collaborators.catalog_url.is_none() || collaborators.directory_url.is_none() {
        warnings.push_with_hint(
            "catalog or connection directory URL missing; the publisher role cannot start",
            "Set ATTEST_CATALOG_URL and ATTEST_DIRECTORY_URL",
        );
    }

    if collaborators.engine_url.is_none() {
        warnings.push_with_hint(
            "query engine URL missing; the worker role cannot start",
            "Set ATTEST_ENGINE_URL",
        );
    }

    Ok(warnings)
}
