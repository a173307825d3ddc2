use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};

use manifold_backend_sqlx::metadata::MetadataPool;
use manifold_backend_sqlx::{HandlerError, TaskHandler, TaskScheduler, TaskWorker};
use manifold_core::registries::{NewRegistry, RegistryRepository};
use manifold_core::tasks::{NewTask, SourceRef, Task, TaskEventRepository, TaskRepository, TaskSource};
use manifold_core::RegistryId;

mod config;
use crate::config::Config;

#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring the metadata schema up to date.
    Migrate,
    /// Manage tenants.
    #[command(subcommand)]
    Registry(RegistryCommand),
    /// Inspect and re-queue tasks.
    #[command(subcommand)]
    Tasks(TasksCommand),
    /// Run a task worker until interrupted.
    Worker,
}

#[derive(Subcommand)]
enum RegistryCommand {
    Create {
        name: String,
        #[arg(long)]
        parent: Option<i64>,
    },
}

#[derive(Subcommand)]
enum TasksCommand {
    Pending {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    Show {
        key: String,
    },
    /// Trigger another run of an existing task.
    Requeue {
        key: String,
        #[arg(long, default_value = "cli")]
        source_id: String,
    },
}

/// Logs every claimed task and reports success.
struct LoggingHandler;

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, task: &Task, sources: &[TaskSource]) -> std::result::Result<(), HandlerError> {
        tracing::info!(
            key = %task.key,
            kind = %task.kind,
            payload_bytes = task.payload.len(),
            sources = sources.len(),
            "handling task"
        );
        for source in sources {
            tracing::debug!(source_type = %source.source_type, source_id = %source.source_id, "triggered by");
        }
        Ok(())
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let mut file = File::open(path.unwrap_or("./manifold.yml".into()))?;
    let mut s = String::new();
    file.read_to_string(&mut s)?;
    Ok(serde_yaml::from_str(&s)?)
}

fn print_task(task: &Task) {
    println!(
        "{}\t{}\t{}\trun_again={}\tupdated={}",
        task.key,
        task.kind,
        task.status,
        task.run_again,
        task.updated_at.to_rfc3339()
    );
}

async fn tasks(metadata: MetadataPool, command: TasksCommand) -> Result<()> {
    let mut conn = metadata.conn(None).await?;
    match command {
        TasksCommand::Pending { limit } => {
            for task in conn.list_pending_tasks(limit).await? {
                print_task(&task);
            }
        }
        TasksCommand::Show { key } => {
            print_task(&conn.find_task(&key).await?);
            for event in conn.list_task_events(&key).await? {
                println!(
                    "  {}\t{}\t{}",
                    event.created_at.to_rfc3339(),
                    event.event,
                    String::from_utf8_lossy(&event.payload)
                );
            }
        }
        TasksCommand::Requeue { key, source_id } => {
            let task = conn.find_task(&key).await?;
            drop(conn);
            let scheduled = TaskScheduler::new(metadata)
                .enqueue(
                    NewTask {
                        key: task.key,
                        kind: task.kind,
                        payload: task.payload,
                    },
                    SourceRef::new("manual", source_id),
                )
                .await?;
            println!("{key}: {scheduled:?}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .compact()
        .init();

    let config = load_config(cli.config_file)?;
    let metadata = config.database.new_metadata().await?;

    match cli.command {
        Command::Migrate => metadata.migrate().await?,
        Command::Registry(RegistryCommand::Create { name, parent }) => {
            let mut conn = metadata.conn(None).await?;
            let registry = conn
                .create_registry(&NewRegistry {
                    parent_id: parent.map(RegistryId::new),
                    name,
                })
                .await?;
            println!("{}\t{}\troot={}", registry.id, registry.name, registry.root_parent_id);
        }
        Command::Tasks(command) => tasks(metadata.clone(), command).await?,
        Command::Worker => {
            let worker = TaskWorker::new(metadata.clone(), LoggingHandler, config.worker_config());
            worker
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("unable to listen for shutdown signal: {e}");
                    }
                })
                .await?;
        }
    }

    metadata.close().await;
    Ok(())
}
