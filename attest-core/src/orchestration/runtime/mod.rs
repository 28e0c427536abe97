//! In-process supervision of the orchestrator roles.
//!
//! Every role is a loop that only talks to the store and the queue, so a
//! process may run any subset of them and scale each one independently.

mod supervisor;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use supervisor::{OrchestratorRuntime, OrchestratorRuntimeBuilder};

use crate::error::ComplianceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Fan-out, dispatch, timeout and retry sweeps.
    Publisher,
    /// Fan-in and job completion.
    Reconciler,
    /// Consumes runner and summarizer results.
    Results,
    /// Executes runner jobs.
    Worker,
    /// Builds job reports.
    Summarizer,
    Retention,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Publisher,
        Role::Reconciler,
        Role::Results,
        Role::Worker,
        Role::Summarizer,
        Role::Retention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Reconciler => "reconciler",
            Role::Results => "results",
            Role::Worker => "worker",
            Role::Summarizer => "summarizer",
            Role::Retention => "retention",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ComplianceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ComplianceError::InvalidInput(format!("unknown role {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_from_their_names() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert_eq!(" Worker ".parse::<Role>().unwrap(), Role::Worker);
        assert!("sink".parse::<Role>().is_err());
    }
}
