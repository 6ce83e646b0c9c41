//! Quillrun CLI - drive sequential generation against a writing backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use quillrun_client::ApiClient;
use quillrun_core::{BatchId, BatchJob, BatchParameters, GenerationRequest, ProjectId, UnitId};
use quillrun_engine::{BatchEvent, Engine, EngineConfig, GenerationObserver, Services, UnitStore};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Quillrun CLI - sequential long-form generation
#[derive(Parser)]
#[command(name = "quillrun")]
#[command(about = "Generate units in order, gated on analysis of their predecessors", long_about = None)]
struct Cli {
    /// Backend API base URL
    #[arg(long, env = "QUILLRUN_API", default_value = "http://127.0.0.1:8000")]
    api: String,

    /// Engine configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a unit may be generated
    Gate {
        #[arg(long)]
        project: String,

        #[arg(long)]
        unit: String,
    },

    /// Generate one unit
    Generate {
        #[arg(long)]
        unit: String,

        /// Writing style
        #[arg(long)]
        style: String,

        /// Target word count
        #[arg(long)]
        words: u32,

        /// Model override
        #[arg(long)]
        model: Option<String>,
    },

    /// Batch operations
    #[command(subcommand)]
    Batch(BatchCommands),

    /// Reattach to a project's active batch and follow it
    Recover {
        #[arg(long)]
        project: String,
    },
}

#[derive(Subcommand)]
enum BatchCommands {
    /// Start a batch and follow it until it finishes
    Start {
        #[arg(long)]
        project: String,

        /// First sequence number
        #[arg(long)]
        from: u32,

        /// Number of units in the range
        #[arg(long)]
        count: u32,

        #[arg(long)]
        style: String,

        #[arg(long)]
        words: u32,

        #[arg(long)]
        model: Option<String>,

        /// Narrative perspective override
        #[arg(long)]
        perspective: Option<String>,
    },

    /// Show a batch
    Status {
        /// Batch ID
        id: String,
    },

    /// Cancel a batch
    Cancel {
        /// Batch ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&cli.log_level))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    let client = Arc::new(ApiClient::new(&cli.api)?);
    let services = Services::from_backend(client);
    let engine = Engine::new(services.clone(), config);

    // Ctrl-C aborts the running command.
    let interrupt = CancellationToken::new();
    let handler_token = interrupt.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    info!(api = %cli.api, "Starting quillrun");

    let result = match cli.command {
        Commands::Gate { project, unit } => gate(&engine, &services, project, unit).await,
        Commands::Generate {
            unit,
            style,
            words,
            model,
        } => {
            let mut request = GenerationRequest::new(UnitId::new(unit), style, words);
            if let Some(model) = model {
                request = request.with_model(model);
            }
            generate(&engine, request, &interrupt).await
        }
        Commands::Batch(BatchCommands::Start {
            project,
            from,
            count,
            style,
            words,
            model,
            perspective,
        }) => {
            let mut parameters = BatchParameters::new(style, words);
            if let Some(model) = model {
                parameters = parameters.with_model(model);
            }
            if let Some(perspective) = perspective {
                parameters = parameters.with_perspective(perspective);
            }
            batch_start(&engine, ProjectId::new(project), from, count, parameters, &interrupt)
                .await
        }
        Commands::Batch(BatchCommands::Status { id }) => {
            let job = engine.batches.poll(&BatchId::new(id)).await?;
            print_job(&job)
        }
        Commands::Batch(BatchCommands::Cancel { id }) => {
            let batch_id = BatchId::new(id);
            engine.batches.cancel(&batch_id).await?;
            println!("Cancellation requested for batch {}", batch_id);
            Ok(())
        }
        Commands::Recover { project } => {
            recover(&engine, ProjectId::new(project), &interrupt).await
        }
    };

    engine.shutdown().await;
    result
}

fn load_config(path: Option<&Path>) -> CliResult<EngineConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

async fn gate(
    engine: &Engine,
    services: &Services,
    project: String,
    unit: String,
) -> CliResult<()> {
    let unit = services.units.unit(&UnitId::new(unit)).await?;
    if unit.project_id.as_str() != project {
        return Err(format!("unit {} does not belong to project {}", unit.id, project).into());
    }

    match engine.generator.check_gate(&unit).await {
        Ok(()) => {
            println!("Unit {} ({}) can be generated", unit.sequence_number, unit.id);
            Ok(())
        }
        Err(e) if e.is_recoverable() => {
            println!("{}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Writes generation progress to stderr.
struct StderrProgress;

impl GenerationObserver for StderrProgress {
    fn on_progress(&self, message: &str, percent: u8) {
        eprintln!("[{:>3}%] {}", percent, message);
    }
}

async fn generate(
    engine: &Engine,
    request: GenerationRequest,
    interrupt: &CancellationToken,
) -> CliResult<()> {
    let outcome = engine
        .generator
        .generate(&request, &StderrProgress, interrupt)
        .await?;

    println!("{}", outcome.final_content);
    if let Some(words) = outcome.word_count {
        eprintln!("{} words", words);
    }

    if let Some(task_id) = outcome.analysis_task_id {
        eprintln!("Waiting for analysis of unit {}...", outcome.sequence_number);
        tokio::select! {
            state = engine.tracker.wait_terminal(&outcome.unit_id, &task_id) => match state {
                Some(state) => eprintln!("Analysis {}", state.status),
                None => warn!(unit_id = %outcome.unit_id, "Analysis not finished before timeout"),
            },
            _ = interrupt.cancelled() => {}
        }
    }
    Ok(())
}

async fn batch_start(
    engine: &Engine,
    project_id: ProjectId,
    start_sequence: u32,
    count: u32,
    parameters: BatchParameters,
    interrupt: &CancellationToken,
) -> CliResult<()> {
    let events = engine.batches.subscribe();
    let job = engine
        .batches
        .start(project_id, start_sequence, count, parameters)
        .await?;
    println!("Batch {} started ({} units)", job.batch_id, job.total);

    follow(engine, &job.batch_id, events, interrupt).await
}

async fn recover(
    engine: &Engine,
    project_id: ProjectId,
    interrupt: &CancellationToken,
) -> CliResult<()> {
    let events = engine.batches.subscribe();
    let Some(job) = engine.recovery.recover_active(&project_id).await? else {
        println!("No active batch in project {}", project_id);
        return Ok(());
    };
    println!(
        "Following batch {} ({}/{} completed)",
        job.batch_id, job.completed, job.total
    );

    follow(engine, &job.batch_id, events, interrupt).await
}

/// Print batch events until the batch is terminal. Ctrl-C requests
/// cancellation and keeps following so the final state is shown.
async fn follow(
    engine: &Engine,
    batch_id: &BatchId,
    mut events: broadcast::Receiver<BatchEvent>,
    interrupt: &CancellationToken,
) -> CliResult<()> {
    let printer_id = batch_id.clone();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.batch_id() == &printer_id => print_event(&event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Dropped batch events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let wait = engine.batches.wait(batch_id);
    tokio::pin!(wait);
    let job = tokio::select! {
        job = &mut wait => job?,
        _ = interrupt.cancelled() => {
            eprintln!("Cancelling batch {}...", batch_id);
            engine.batches.cancel(batch_id).await?;
            wait.await?
        }
    };
    printer.abort();

    print_job(&job)?;
    if let Some(cause) = engine.batches.halt_error(batch_id).await {
        eprintln!("Batch halted: {}", cause);
    }
    Ok(())
}

fn print_event(event: &BatchEvent) {
    match event {
        BatchEvent::UnitStarted { sequence, .. } => eprintln!("Generating unit {}", sequence),
        BatchEvent::UnitProgress {
            sequence,
            message,
            percent,
            ..
        } => eprintln!("  unit {} [{:>3}%] {}", sequence, percent, message),
        BatchEvent::UnitCompleted {
            sequence,
            completed,
            total,
            ..
        } => eprintln!("Unit {} done ({}/{})", sequence, completed, total),
        BatchEvent::Finished { job } => eprintln!("Batch {} {}", job.batch_id, job.status),
        BatchEvent::Started { .. } | BatchEvent::Progress { .. } => {}
    }
}

fn print_job(job: &BatchJob) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    eprintln!(
        "{}: {}/{} units ({}%)",
        job.status,
        job.completed,
        job.total,
        job.progress_percent()
    );
    Ok(())
}
