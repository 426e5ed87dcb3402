// maas-temporal-worker
//
// Decision: Use clap derive with env fallbacks, same variables as WorkerConfig
// Decision: Control commands share the worker's store, so they only make sense with DATABASE_URL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use maas_durable::{ExecutorError, StartOptions, WorkflowExecutor, WorkflowInfo};
use maas_workflows::config::WorkerConfig;
use maas_workflows::msm::enrol::queries as enrol_queries;
use maas_workflows::msm::heartbeat::queries as heartbeat_queries;
use maas_workflows::msm::types::{ENROL_WORKFLOW_ID, HEARTBEAT_WORKFLOW_ID};
use maas_workflows::msm::{MsmEnrolParam, MsmEnrolSiteWorkflow};
use maas_workflows::telemetry::{init_telemetry, TelemetryConfig};
use maas_workflows::{
    build_executor, Collaborators, ConfigureWorkerPoolInput, ConfigureWorkerPoolWorkflow,
    WorkerRuntime,
};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "maas-temporal-worker")]
#[command(about = "MAAS durable workflow worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run worker pools and the timer service until interrupted
    Run,

    /// MAAS Site Manager enrolment
    Msm {
        #[command(subcommand)]
        command: MsmCommand,
    },

    /// Start one worker per VLAN of a rack controller
    ConfigureWorkerPool {
        /// Rack controller system id
        system_id: String,
    },

    /// Cancel (or terminate) a workflow
    Cancel {
        workflow_id: String,

        #[arg(long, default_value = "cancelled from CLI")]
        reason: String,

        /// Terminate instead of cancelling
        #[arg(long)]
        terminate: bool,
    },
}

#[derive(Subcommand)]
enum MsmCommand {
    /// Enrol this site with MAAS Site Manager
    Enrol {
        /// Enrolment endpoint
        #[arg(long)]
        url: String,

        /// Enrolment token
        #[arg(long, env = "MSM_ENROL_TOKEN")]
        jwt: String,

        #[arg(long)]
        site_name: String,

        #[arg(long)]
        site_url: String,

        #[arg(long)]
        cluster_uuid: String,

        /// Path to a YAML mapping merged into the enrolment request
        #[arg(long)]
        metainfo: Option<std::path::PathBuf>,
    },

    /// Show enrolment and heartbeat state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    let telemetry = TelemetryConfig {
        log_filter: TelemetryConfig::from_env().log_filter.or(config.log_level.clone()),
        ..Default::default()
    };
    init_telemetry(&telemetry).context("Failed to initialize logging")?;

    let collaborators = Collaborators::connect(&config)
        .await
        .context("Failed to connect collaborators")?;

    match cli.command {
        Commands::Run => run(&config, &collaborators).await,
        Commands::Msm { command } => {
            let executor = control_executor(&config, &collaborators);
            match command {
                MsmCommand::Enrol {
                    url,
                    jwt,
                    site_name,
                    site_url,
                    cluster_uuid,
                    metainfo,
                } => {
                    let metainfo = match metainfo {
                        Some(path) => Some(
                            std::fs::read_to_string(&path)
                                .with_context(|| format!("Failed to read {}", path.display()))?,
                        ),
                        None => None,
                    };
                    let param = MsmEnrolParam {
                        site_name,
                        site_url,
                        url,
                        jwt,
                        cluster_uuid,
                        metainfo,
                    };
                    msm_enrol(&executor, param).await
                }
                MsmCommand::Status => msm_status(&executor).await,
            }
        }
        Commands::ConfigureWorkerPool { system_id } => {
            let executor = control_executor(&config, &collaborators);
            configure_worker_pool(&executor, system_id).await
        }
        Commands::Cancel {
            workflow_id,
            reason,
            terminate,
        } => {
            let executor = control_executor(&config, &collaborators);
            let stopped = if terminate {
                executor.terminate_workflow(&workflow_id, reason).await
            } else {
                executor.cancel_workflow(&workflow_id, reason).await
            };
            stopped.with_context(|| format!("Failed to stop {workflow_id}"))?;
            print_run(&executor.describe_workflow(&workflow_id).await?);
            Ok(())
        }
    }
}

async fn run(config: &WorkerConfig, collaborators: &Collaborators) -> Result<()> {
    tracing::info!(
        worker_id = %config.worker_id,
        task_queues = ?config.task_queues,
        max_concurrent = config.max_concurrent_tasks,
        "maas-temporal-worker starting"
    );

    let runtime = WorkerRuntime::new(config, collaborators);
    runtime
        .start()
        .await
        .context("Failed to start worker runtime")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    runtime.shutdown().await;
    tracing::info!("Worker shutdown complete");
    Ok(())
}

fn control_executor(config: &WorkerConfig, collaborators: &Collaborators) -> WorkflowExecutor {
    if config.database_url.is_none() {
        tracing::warn!("DATABASE_URL not set, the command only sees this process");
    }
    let queue = config
        .task_queues
        .first()
        .map(String::as_str)
        .unwrap_or(maas_workflows::config::DEFAULT_TASK_QUEUE);
    build_executor(collaborators, queue)
}

async fn msm_enrol(executor: &WorkflowExecutor, param: MsmEnrolParam) -> Result<()> {
    let run = executor
        .start_workflow::<MsmEnrolSiteWorkflow>(StartOptions::new(ENROL_WORKFLOW_ID), param)
        .await
        .context("Failed to start enrolment")?;
    if run.existing {
        tracing::info!(run_id = %run.run_id, "joined running enrolment");
    }
    print_run(&executor.describe_run(run.run_id).await?);
    Ok(())
}

async fn msm_status(executor: &WorkflowExecutor) -> Result<()> {
    let status = json!({
        "enrolment": {
            "run": describe(executor, ENROL_WORKFLOW_ID).await?,
            "pending": query(executor, ENROL_WORKFLOW_ID, enrol_queries::IS_PENDING).await?,
            "error": query(executor, ENROL_WORKFLOW_ID, enrol_queries::ENROLMENT_ERROR).await?,
        },
        "heartbeat": {
            "run": describe(executor, HEARTBEAT_WORKFLOW_ID).await?,
            "running": query(executor, HEARTBEAT_WORKFLOW_ID, heartbeat_queries::IS_RUNNING).await?,
        },
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn configure_worker_pool(executor: &WorkflowExecutor, system_id: String) -> Result<()> {
    let workflow_id = format!("configure-worker-pool:{system_id}");
    let run = executor
        .start_workflow::<ConfigureWorkerPoolWorkflow>(
            StartOptions::new(workflow_id),
            ConfigureWorkerPoolInput { system_id },
        )
        .await
        .context("Failed to start configure_worker_pool")?;
    print_run(&executor.describe_run(run.run_id).await?);
    Ok(())
}

/// `null` when the workflow has never run
async fn describe(executor: &WorkflowExecutor, workflow_id: &str) -> Result<Value> {
    match executor.describe_workflow(workflow_id).await {
        Ok(info) => Ok(run_json(&info)),
        Err(ExecutorError::WorkflowNotFound(_)) => Ok(Value::Null),
        Err(e) => Err(e).with_context(|| format!("Failed to describe {workflow_id}")),
    }
}

async fn query(executor: &WorkflowExecutor, workflow_id: &str, query_type: &str) -> Result<Value> {
    match executor.query_workflow(workflow_id, query_type).await {
        Ok(value) => Ok(value),
        Err(ExecutorError::WorkflowNotFound(_)) => Ok(Value::Null),
        Err(e) => Err(e).with_context(|| format!("Failed to query {workflow_id}")),
    }
}

fn run_json(info: &WorkflowInfo) -> Value {
    json!({
        "workflow_id": info.workflow_id,
        "run_id": info.run_id,
        "workflow_type": info.workflow_type,
        "task_queue": info.task_queue,
        "status": info.status.as_str(),
        "result": info.result,
        "error": info.error,
        "updated_at": info.updated_at,
    })
}

fn print_run(info: &WorkflowInfo) {
    match serde_json::to_string_pretty(&run_json(info)) {
        Ok(text) => println!("{text}"),
        Err(e) => tracing::error!(error = %e, "Failed to render run"),
    }
}
