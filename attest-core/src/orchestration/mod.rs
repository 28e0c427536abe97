//! Distributed state machine that drives compliance jobs from creation to a
//! terminal state.

pub mod catalog;
pub mod condition;
pub mod config;
pub mod expansion;
pub mod memory_queue;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod reconciler;
pub mod repository;
pub mod results;
pub mod retention;
pub mod runtime;
pub mod service;
pub mod summarizer;
pub mod worker;

#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub mod http;

#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod persistence;

#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod pg_queue;

#[cfg(test)]
pub(crate) mod testing;
