use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dash_net::client::Client;
use dash_net::config::{NodeConfig, SandboxConfig};
use dash_net::error::DashError;
use dash_net::node::Node;
use dash_net::shutdown::install_shutdown_handler;
use dash_net::store::{MemoryStore, StoreRef};
use dash_net::tasks::{TaskRecord, TaskStatus};
use dash_net::worker::{ProcessSandbox, Sandbox};

#[derive(Parser, Debug)]
#[command(name = "dash-net")]
#[command(version)]
#[command(about = "Offload code execution to a network of worker nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process network of workers with a dashboard until interrupted
    Network(NetworkArgs),

    /// Submit a source file to an in-process network and wait for its result
    Submit(SubmitArgs),

    /// Execute a source file locally without touching the network
    Run(RunArgs),
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SandboxArgs {
    /// Interpreter used to execute source files
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Kill an execution after this many milliseconds
    #[arg(long)]
    exec_timeout_ms: Option<u64>,
}

impl SandboxArgs {
    fn config(&self) -> SandboxConfig {
        let config = SandboxConfig::new(&self.interpreter);
        match self.exec_timeout_ms {
            Some(ms) => config.with_timeout_ms(ms),
            None => config,
        }
    }
}

#[derive(Parser, Debug)]
struct NetworkArgs {
    /// Number of worker nodes to start
    #[arg(long, short = 'w', default_value = "3")]
    workers: usize,

    /// Dashboard port
    #[arg(long, default_value = "8080")]
    dashboard_port: u16,

    /// Reconciler tick interval in milliseconds
    #[arg(long, default_value = "1000")]
    reconcile_interval_ms: u64,

    /// Requeue running tasks with no update for this many milliseconds
    #[arg(long)]
    stale_running_after_ms: Option<u64>,

    #[command(flatten)]
    sandbox: SandboxArgs,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Source file to execute
    file: PathBuf,

    /// Language tag of the source
    #[arg(long, default_value = "python")]
    language: String,

    /// Number of worker nodes to start
    #[arg(long, short = 'w', default_value = "2")]
    workers: usize,

    /// Give up waiting after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    #[command(flatten)]
    sandbox: SandboxArgs,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Source file to execute
    file: PathBuf,

    #[command(flatten)]
    sandbox: SandboxArgs,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskOutput {
    task_id: String,
    status: TaskStatus,
    worker_id: Option<String>,
    output: Option<String>,
    requeues: u32,
}

impl From<&TaskRecord> for TaskOutput {
    fn from(task: &TaskRecord) -> Self {
        Self {
            task_id: task.task_id.to_string(),
            status: task.status,
            worker_id: task.worker_id.as_ref().map(ToString::to_string),
            output: task.output.clone(),
            requeues: task.requeues,
        }
    }
}

// =============================================================================
// In-process Network
// =============================================================================

fn spawn_workers(
    hub: &MemoryStore,
    count: usize,
    config: &NodeConfig,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let hub = hub.clone();
            let config = config.clone();
            let token = token.child_token();
            tokio::spawn(async move {
                let store: StoreRef = hub.connect().await;
                if let Err(e) = Node::new(config, store).run(token).await {
                    tracing::error!(worker = index, error = %e, "Worker node failed");
                }
            })
        })
        .collect()
}

async fn run_network(args: NetworkArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dashboard_addr: SocketAddr = format!("0.0.0.0:{}", args.dashboard_port).parse()?;
    let token = install_shutdown_handler();
    let hub = MemoryStore::new();

    let mut worker_config = NodeConfig::worker().with_sandbox(args.sandbox.config());
    worker_config.reconcile_interval_ms = args.reconcile_interval_ms;
    worker_config.stale_running_after_ms = args.stale_running_after_ms;

    tracing::info!(
        workers = args.workers,
        dashboard_addr = %dashboard_addr,
        interpreter = %worker_config.sandbox.interpreter,
        "Starting dash-net network"
    );

    let mut handles = spawn_workers(&hub, args.workers, &worker_config, &token);

    let mut client_config = NodeConfig::client().with_dashboard(dashboard_addr);
    client_config.reconcile_interval_ms = args.reconcile_interval_ms;
    client_config.sandbox = worker_config.sandbox.clone();
    let client_store: StoreRef = hub.connect().await;
    let client_token = token.child_token();
    handles.push(tokio::spawn(async move {
        if let Err(e) = Node::new(client_config, client_store).run(client_token).await {
            tracing::error!(error = %e, "Client node failed");
        }
    }));

    token.cancelled().await;
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Network stopped");
    Ok(())
}

async fn handle_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let code = tokio::fs::read_to_string(&args.file).await?;
    let token = install_shutdown_handler();
    let hub = MemoryStore::new();
    let sandbox_config = args.sandbox.config();

    let worker_config = NodeConfig::worker()
        .with_capability(&args.language)
        .with_sandbox(sandbox_config.clone());
    let handles = spawn_workers(&hub, args.workers, &worker_config, &token);

    let sandbox: Arc<dyn Sandbox> = Arc::new(ProcessSandbox::new(sandbox_config));
    let client = Client::connect(hub.connect().await, sandbox).await?;
    let task_id = client.submit_with_language(&code, &args.language).await?;
    eprintln!("Task {} submitted, waiting for a worker...", task_id);

    let waited = tokio::select! {
        result = await_with_timeout(&client, &task_id, args.timeout_secs) => result,
        _ = token.cancelled() => Err("Interrupted".into()),
    };

    client.shutdown().await?;
    token.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    let task = waited?;
    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&TaskOutput::from(&task))?);
        }
        OutputFormat::Table => {
            println!("Task ID:  {}", task.task_id);
            println!("Status:   {}", task.status);
            if let Some(worker_id) = &task.worker_id {
                println!("Worker:   {}", worker_id);
            }
            if let Some(output) = &task.output {
                println!("Output:");
                for line in output.lines() {
                    println!("  {}", line);
                }
            }
        }
    }

    if task.status == TaskStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn await_with_timeout(
    client: &Client,
    task_id: &dash_net::tasks::TaskId,
    timeout_secs: Option<u64>,
) -> Result<TaskRecord, Box<dyn std::error::Error>> {
    let wait = client.await_result(task_id);
    match timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), wait).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(format!("Timed out after {}s waiting for task {}", secs, task_id).into()),
        },
        None => Ok(wait.await?),
    }
}

async fn handle_run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let code = tokio::fs::read_to_string(&args.file).await?;
    if code.trim().is_empty() {
        return Err(DashError::InvalidInput("code must not be empty".to_string()).into());
    }

    let sandbox = ProcessSandbox::new(args.sandbox.config());
    match sandbox.execute(&code).await {
        Ok(output) => {
            print!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dash_net=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Network(network_args) => run_network(network_args).await?,
        Commands::Submit(submit_args) => handle_submit(submit_args).await?,
        Commands::Run(run_args) => handle_run(run_args).await?,
    }

    Ok(())
}
