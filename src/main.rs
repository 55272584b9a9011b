use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, process};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use nodeflow::{
    capability::Capabilities,
    config::{ConfigManager, EngineConfig, EnvConfigManager},
    flow::manager::{ExecutionService, ExecutionStatus},
    flow::observer::TracingObserver,
    graph::{FlowDocument, FlowGraph, levelize},
    logger::init_tracing,
    node::ExecutorRegistry,
    schema::write_schema,
    store::{FileStore, InMemoryStore, Store},
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nodeflow", about = "Run node-graph workflows", version)]
struct Cli {
    /// Log level or `EnvFilter` directive (e.g. error, warn, info, debug, nodeflow=trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for the rolling text log and the JSON execution log
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// `.env` file with NODEFLOW_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a flow document (JSON or YAML) and print the run report
    Run(RunArgs),

    /// Check that a flow document parses, has no cycles and only known node types
    Validate { file: PathBuf },

    /// Emit JSON-Schema for flow documents, execution records and node configs
    Schema { out_dir: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    file: PathBuf,

    /// Id recorded on the execution; defaults to the file stem
    #[arg(long)]
    flow_id: Option<String>,

    /// Pause before every node, in milliseconds
    #[arg(long)]
    step_delay_ms: Option<u64>,

    /// Persist execution records and integrations as JSON files under this directory
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

fn load_document(path: &Path) -> anyhow::Result<FlowDocument> {
    let text = fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))?;
    let doc = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml_bw::from_str(&text)
            .with_context(|| format!("{} is not a valid YAML flow", path.display()))?,
        _ => serde_json::from_str(&text)
            .with_context(|| format!("{} is not a valid JSON flow", path.display()))?,
    };
    Ok(doc)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_file = "nodeflow.log";

    match cli.command {
        Commands::Run(args) => {
            init_tracing(&cli.log_dir, log_file, &cli.log_level)?;
            let status = run(args, &cli.env_file).await?;
            if status != ExecutionStatus::Completed {
                process::exit(1);
            }
            Ok(())
        }
        Commands::Validate { file } => {
            let doc = load_document(&file)?;
            let graph = FlowGraph::try_from(doc)?;
            let levels = levelize(&graph)?;
            let registry = ExecutorRegistry::builtin();
            for node in graph.nodes() {
                registry.resolve(node)?;
            }
            println!("Flow is valid: {} nodes in {} levels.", graph.nodes().len(), levels.len());
            for (depth, level) in levels.iter().enumerate() {
                println!("  level {depth}: {}", level.join(", "));
            }
            Ok(())
        }
        Commands::Schema { out_dir } => {
            let written = write_schema(&out_dir)?;
            println!("{} schemas written to {}", written.len(), out_dir.display());
            Ok(())
        }
    }
}

async fn run(args: RunArgs, env_file: &Path) -> anyhow::Result<ExecutionStatus> {
    let doc = load_document(&args.file)?;
    let flow_id = args.flow_id.clone().unwrap_or_else(|| {
        args.file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flow".to_string())
    });

    let config_mgr = ConfigManager(EnvConfigManager::new(env_file.to_path_buf()));
    let mut config = EngineConfig::load(&config_mgr).await;
    if let Some(ms) = args.step_delay_ms {
        config = config.with_step_delay(ms);
    }
    info!(?config, %flow_id, "nodeflow starting");

    let store: Arc<dyn Store> = match &args.store_dir {
        Some(dir) => FileStore::new(dir),
        None => InMemoryStore::new(),
    };
    let capabilities = Capabilities::headless(std::time::Duration::from_millis(config.http_timeout_ms))
        .with_store(store);
    let service = ExecutionService::new(
        Arc::new(ExecutorRegistry::builtin()),
        Arc::new(capabilities),
        Arc::new(TracingObserver),
        config,
    );

    let id = service.start(&flow_id, doc.into()).await?;
    let record = tokio::select! {
        record = service.wait(&id) => record?,
        _ = tokio::signal::ctrl_c() => {
            warn!(execution_id = %id, "interrupted; cancelling");
            service.cancel(&id).await?
        }
    };

    match record.status {
        ExecutionStatus::Completed => {
            let Some(report) = service.get_report(&id) else {
                bail!("execution {id} completed without a report");
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ExecutionStatus::Error => {
            let message = record.error.clone().unwrap_or_default();
            error!(execution_id = %id, %message, "execution failed");
            eprintln!("Execution {id} failed: {message}");
        }
        other => eprintln!("Execution {id} ended as {other}"),
    }
    Ok(record.status)
}
