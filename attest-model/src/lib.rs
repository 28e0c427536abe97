//! Core data model definitions shared across attest crates.
//!
//! Everything that crosses a process boundary lives here: persisted job,
//! runner and summarizer records, the catalog shapes returned by the query
//! catalog and connection directory, and the queue message envelopes.
#![allow(missing_docs)]

pub mod catalog;
pub mod error;
pub mod findings;
pub mod ids;
pub mod job;
pub mod messages;
pub mod runner;
pub mod status;

pub use catalog::{
    Benchmark, Connection, HealthState, Policy, QueryDefinition, Severity,
};
pub use error::{ModelError, Result as ModelResult};
pub use findings::{
    ComplianceResult, Finding, JobReport, QueryOutput, RunnerFailure,
};
pub use ids::{JobId, RunnerId, SummarizerId};
pub use job::{ComplianceJob, JobScope};
pub use messages::{
    RunnerJob, RunnerResult, SummarizerJob, SummarizerResult, message_key,
};
pub use runner::{Caller, RunnerRecord, SummarizerRecord};
pub use status::{Connector, JobStatus, RunnerStatus, TriggerType};
