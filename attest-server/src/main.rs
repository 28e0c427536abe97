//! # Attest Server
//!
//! Runs any subset of the compliance orchestrator roles against a shared
//! PostgreSQL database, plus a few operator commands.
//!
//! Every process started with the same configuration cooperates through the
//! database alone, so roles can be split across machines and scaled
//! independently:
//!
//! - `publisher`: expands jobs, dispatches runners and summarizers, sweeps
//!   timeouts and retries
//! - `worker`: executes runner jobs against the query engine
//! - `results`: applies runner and summarizer results
//! - `reconciler`: fans runners in and finishes jobs
//! - `summarizer`: builds job reports
//! - `retention`: purges old rows

mod cli;

use std::sync::Arc;

use anyhow::{Context, bail};
use attest_config::{Config, ConfigLoad, ConfigLoader};
use attest_core::{
    ComplianceService, OrchestratorMetrics, PostgresComplianceStore, TriggerRequest,
    orchestration::{
        http::{HttpConnectionDirectory, HttpQueryCatalog, HttpQueryEngine},
        pg_queue::PostgresDispatchQueue,
        repository::JobFilter,
        runtime::{OrchestratorRuntime, Role},
    },
};
use attest_model::JobId;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command, DbCommand, ServeArgs, StatusArgs, TriggerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Per-cycle summaries stay visible; override via RUST_LOG.
                "info,compliance=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        None => serve(config, cli.serve).await,
        Some(Command::Serve(args)) => serve(config, args).await,
        Some(Command::Db {
            command: DbCommand::Migrate,
        }) => {
            let store = connect(&config).await?;
            store.migrate().await.context("failed to apply migrations")?;
            Ok(())
        }
        Some(Command::Trigger(args)) => trigger(config, args).await,
        Some(Command::Status(args)) => status(config, args).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { config, warnings } = loader.load().context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
    Ok(config)
}

async fn connect(config: &Config) -> anyhow::Result<PostgresComplianceStore> {
    let Some(url) = config.database.url.as_deref() else {
        bail!("DATABASE_URL is required");
    };
    let store = PostgresComplianceStore::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to database")?;
    store.health_check().await.context("database health check failed")?;
    Ok(store)
}

async fn serve(config: Config, args: ServeArgs) -> anyhow::Result<()> {
    let roles = args.roles();
    let store = connect(&config).await?;
    if args.migrate {
        store.migrate().await.context("failed to apply migrations")?;
    }

    let orchestrator = &config.orchestrator;
    let queue = Arc::new(PostgresDispatchQueue::new(
        store.pool().clone(),
        orchestrator.queue.visibility_timeout(),
    ));
    let metrics = Arc::new(OrchestratorMetrics::new());

    let mut builder = OrchestratorRuntime::builder(orchestrator.clone(), Arc::new(store), queue)
        .with_metrics(Arc::clone(&metrics))
        .with_instance(config.instance.clone());

    let collaborators = &config.collaborators;
    if let Some(url) = &collaborators.catalog_url {
        builder = builder.with_catalog(Arc::new(HttpQueryCatalog::new(url)?));
    }
    if let Some(url) = &collaborators.directory_url {
        builder = builder.with_directory(Arc::new(HttpConnectionDirectory::new(url)?));
    }
    if let Some(url) = &collaborators.engine_url {
        builder = builder.with_engine(Arc::new(HttpQueryEngine::new(
            url,
            collaborators.engine_timeout(),
        )?));
    }

    let runtime = builder.build();
    runtime
        .start(&roles)
        .await
        .context("failed to start orchestrator roles")?;
    info!(
        roles = %roles.iter().map(Role::as_str).collect::<Vec<_>>().join(","),
        runner_workers = orchestrator.worker.runner_workers,
        max_in_flight = orchestrator.worker.max_in_flight,
        "attest server running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    runtime.shutdown().await?;

    let snapshot = metrics.snapshot();
    info!(
        jobs_succeeded = snapshot.jobs_succeeded,
        jobs_failed = snapshot.jobs_failed,
        jobs_timed_out = snapshot.jobs_timed_out,
        runners_published = snapshot.runners_published,
        findings_ingested = snapshot.findings_ingested,
        "attest server stopped"
    );
    Ok(())
}

async fn service(config: &Config) -> anyhow::Result<ComplianceService> {
    let store = connect(config).await?;
    Ok(ComplianceService::new(
        Arc::new(store),
        Arc::new(OrchestratorMetrics::new()),
    ))
}

async fn trigger(config: Config, args: TriggerArgs) -> anyhow::Result<()> {
    let service = service(&config).await?;

    let mut request = if args.scheduled {
        TriggerRequest::scheduled(args.benchmark_id)
    } else {
        TriggerRequest::manual(args.benchmark_id)
    }
    .with_connections(args.connections);
    if let Some(connector) = args.connector {
        request = request.with_connector(connector);
    }
    if let Some(request_id) = args.request_id {
        request = request.with_request_id(request_id);
    }

    let outcome = service.trigger(request).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "created": outcome.created,
            "job": outcome.job,
        }))?
    );
    Ok(())
}

async fn status(config: Config, args: StatusArgs) -> anyhow::Result<()> {
    let service = service(&config).await?;

    let Some(id) = args.job_id.map(JobId::from) else {
        let jobs = service
            .list_jobs(&JobFilter {
                limit: Some(args.limit),
                ..JobFilter::default()
            })
            .await?;
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    };

    let job = service.get_job(id).await?;
    let report = service.get_report(id).await?;
    let mut body = json!({ "job": job, "report": report });
    if args.runners {
        body["runners"] = serde_json::to_value(service.list_runners_for_job(id).await?)?;
        body["summarizers"] = serde_json::to_value(service.list_summarizers_for_job(id).await?)?;
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
