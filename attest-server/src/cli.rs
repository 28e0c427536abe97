use std::path::PathBuf;

use attest_core::orchestration::runtime::Role;
use attest_model::Connector;
use clap::{Args as ClapArgs, Parser, Subcommand};
use uuid::Uuid;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "attest-server")]
#[command(about = "Compliance benchmark orchestrator: fan-out, dispatch, fan-in")]
pub struct Cli {
    /// Configuration file (TOML, or JSON by extension).
    #[arg(long, global = true, env = "ATTEST_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Alternate `.env` file.
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run orchestrator roles until interrupted (default).
    Serve(ServeArgs),
    /// Database maintenance.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Create a compliance job for a benchmark.
    Trigger(TriggerArgs),
    /// Show a job, or the most recent jobs.
    Status(StatusArgs),
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Apply pending migrations.
    Migrate,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Roles to run in this process; repeat or comma-separate. Defaults to all.
    #[arg(long = "role", value_delimiter = ',')]
    pub roles: Vec<Role>,

    /// Apply migrations before starting.
    #[arg(long)]
    pub migrate: bool,
}

impl ServeArgs {
    pub fn roles(&self) -> Vec<Role> {
        if self.roles.is_empty() {
            Role::ALL.to_vec()
        } else {
            let mut roles = Vec::with_capacity(self.roles.len());
            for role in &self.roles {
                if !roles.contains(role) {
                    roles.push(*role);
                }
            }
            roles
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct TriggerArgs {
    pub benchmark_id: String,

    /// Restrict to these connections; repeat or comma-separate.
    #[arg(long = "connection", value_delimiter = ',')]
    pub connections: Vec<String>,

    #[arg(long)]
    pub connector: Option<Connector>,

    /// Mark the job as scheduled instead of manual.
    #[arg(long)]
    pub scheduled: bool,

    /// Idempotency key; repeating it returns the existing job.
    #[arg(long)]
    pub request_id: Option<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct StatusArgs {
    pub job_id: Option<Uuid>,

    /// Include runner and summarizer rows.
    #[arg(long)]
    pub runners: bool,

    /// Jobs listed when no id is given.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_default_to_all() {
        let cli = Cli::try_parse_from(["attest-server"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.roles(), Role::ALL.to_vec());
    }

    #[test]
    fn roles_are_parsed_from_flags() {
        let cli =
            Cli::try_parse_from(["attest-server", "serve", "--role", "worker,results"]).unwrap();
        let Some(Command::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.roles(), vec![Role::Worker, Role::Results]);
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(Cli::try_parse_from(["attest-server", "--role", "janitor"]).is_err());
    }

    #[test]
    fn trigger_arguments() {
        let cli = Cli::try_parse_from([
            "attest-server",
            "trigger",
            "cis",
            "--connection",
            "c1,c2",
            "--connector",
            "aws",
            "--request-id",
            "nightly",
        ])
        .unwrap();
        let Some(Command::Trigger(args)) = cli.command else {
            panic!("expected trigger");
        };
        assert_eq!(args.benchmark_id, "cis");
        assert_eq!(args.connections, vec!["c1", "c2"]);
        assert_eq!(args.connector, Some(Connector::Aws));
        assert!(!args.scheduled);
    }
}
