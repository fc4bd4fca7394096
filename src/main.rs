//! Taskmill CLI - work-dispatch broker for embarrassingly parallel jobs.
//!
//! One binary, three roles: `broker` runs the coordination server, `node`
//! runs a worker that executes processors, `client` submits a processor plus
//! an input list and collects the outputs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use taskmill::{client, config::Config};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "taskmill")]
#[command(version)]
#[command(about = "Work-dispatch broker for embarrassingly parallel batch jobs")]
struct Cli {
    /// Base directory for on-disk state (overrides config).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination broker.
    Broker {
        /// TCP port to listen on (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a worker node against a broker.
    Node {
        /// Broker address (`host` or `host:port`); prompts if omitted.
        #[arg(long)]
        broker: Option<String>,
        /// Interpreter for source-form processors (overrides config).
        #[arg(long)]
        interpreter: Option<String>,
    },
    /// Submit a processor and inputs, wait for all outputs.
    Client {
        /// Broker address (`host` or `host:port`); prompts if omitted.
        #[arg(long)]
        broker: Option<String>,
        /// Path to the processor source to upload.
        #[arg(long)]
        processor: PathBuf,
        /// Optional algorithm id (UUID) naming a precompiled processor.
        #[arg(long)]
        algorithm: Option<uuid::Uuid>,
        /// File with one subtask input per line.
        #[arg(long)]
        inputs: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    // Ctrl-C fans out to every handler loop through the token; a second
    // Ctrl-C kills the process the hard way via the default handler.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Broker { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            taskmill::broker::run(config, shutdown).await
        }
        Commands::Node {
            broker,
            interpreter,
        } => {
            if let Some(interpreter) = interpreter {
                config.interpreter = interpreter;
            }
            let addr = resolve_broker(broker.as_deref(), &config)?;
            taskmill::node::run(addr, config, shutdown).await
        }
        Commands::Client {
            broker,
            processor,
            algorithm,
            inputs,
        } => {
            let addr = resolve_broker(broker.as_deref(), &config)?;
            let input_text = std::fs::read_to_string(&inputs)
                .with_context(|| format!("read inputs {}", inputs.display()))?;
            let job = client::Job {
                processor,
                algorithm,
                inputs: input_text.lines().map(str::to_string).collect(),
            };

            let results = client::run_job(addr, &config, job, shutdown).await?;
            println!(
                "{} result(s) written to {}",
                results.len(),
                config.client_files_dir().join("clientOutput.txt").display()
            );
            Ok(())
        }
    }
}

/// Resolve the broker address from the flag, or ask interactively.
fn resolve_broker(flag: Option<&str>, config: &Config) -> Result<std::net::SocketAddr> {
    match flag {
        Some(input) => client::parse_broker_addr(input, config.port),
        None => client::prompt_broker_addr(config.port),
    }
}
