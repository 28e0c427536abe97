//! # Attest Core
//!
//! Orchestration engine that evaluates compliance benchmarks across many cloud
//! connections without a central coordinator.
//!
//! ## Overview
//!
//! A benchmark evaluation is a [`ComplianceJob`](attest_model::ComplianceJob).
//! The publisher expands a job into runner rows (one per query and
//! connection), hands them to workers through a durable at-least-once
//! [`DispatchQueue`](orchestration::queue::DispatchQueue), and the reconciler
//! fans results back in by counting child states. Once every runner is done a
//! summarizer builds the job report and the job reaches a terminal state.
//!
//! Processes coordinate only through the repository and the queue. Every
//! state change is a conditional, set-based update, so any number of
//! publishers, workers and reconcilers can run side by side.
//!
//! ## Feature Flags
//!
//! - `database`: PostgreSQL store and queue (SQLx) plus embedded migrations
//! - `http`: JSON-over-HTTP clients for the catalog, directory and engine
//!
//! ## Architecture
//!
//! - [`orchestration::repository`]: persistence ports and the in-memory store
//! - [`orchestration::publisher`]: fan-out, dispatch, timeout and retry sweeps
//! - [`orchestration::worker`]: runner and summarizer workers
//! - [`orchestration::results`]: result consumer
//! - [`orchestration::reconciler`]: fan-in and job completion
//! - [`orchestration::runtime`]: task supervision

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub mod error;

pub mod orchestration;

pub use error::{ComplianceError, Result};
pub use orchestration::{
    config::OrchestratorConfig,
    metrics::{MetricsSnapshot, OrchestratorMetrics},
    repository::{ComplianceStore, InMemoryComplianceStore},
    service::{ComplianceService, TriggerOutcome, TriggerRequest},
};

#[cfg(feature = "database")]
pub use orchestration::persistence::PostgresComplianceStore;
