//! CLI entry point for Kiln.
//!
//! The `serve` subcommand connects to the broker and runs a pool of
//! processors against the build queue until shut down; `providers` lists
//! the registered VM backends and their configuration keys. The first
//! interrupt triggers a graceful shutdown (current jobs finish), a second
//! one cancels in-flight jobs so they requeue.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use lapin::{Connection, ConnectionProperties};
use thiserror::Error;
use tracing::error;

use kiln::{
    registry, ConfigError, HttpScriptGenerator, PoolError, PoolSettings, ProcessorPool,
    ProviderConfig, ProviderError, ScriptError, WorkerConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "CI build worker that runs jobs inside ephemeral VMs",
    version,
    arg_required_else_help = true
)]
enum Cli {
    #[command(name = "serve", about = "Consume build jobs and run them")]
    Serve(ServeCommand),
    #[command(
        name = "providers",
        about = "List registered VM providers and their configuration keys"
    )]
    Providers,
}

#[derive(Debug, Parser)]
struct ServeCommand {
    /// Override the number of processors run against the queue.
    #[arg(long, value_name = "N")]
    pool_size: Option<u16>,
    /// Override the build queue name.
    #[arg(long, value_name = "QUEUE")]
    queue: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("script service error: {0}")]
    Script(#[from] ScriptError),
    #[error("couldn't reach the broker: {0}")]
    Broker(String),
    #[error("worker pool failed: {0}")]
    Pool(#[from] PoolError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let exit_code = match cli {
        Cli::Serve(command) => serve(command).await,
        Cli::Providers => Ok(print_providers()),
    }
    .unwrap_or_else(|err| {
        report_error(&err);
        1
    });

    process::exit(exit_code);
}

async fn serve(args: ServeCommand) -> Result<i32, CliError> {
    let mut config = WorkerConfig::load_without_cli_args()?;
    if let Some(pool_size) = args.pool_size {
        config.pool_size = pool_size;
    }
    if let Some(queue) = args.queue {
        config.queue_name = queue;
    }
    config.validate()?;

    let provider_config = ProviderConfig::from_env(&config.provider_env_prefix());
    let provider = registry::build(&config.provider, &provider_config)?;
    let generator = Arc::new(HttpScriptGenerator::new(&config.script_endpoint)?);

    let conn = Connection::connect(&config.amqp_uri, ConnectionProperties::default())
        .await
        .map_err(|err| CliError::Broker(err.to_string()))?;

    let settings = PoolSettings {
        hostname: config.hostname.clone(),
        log_flush_timeout: config.log_flush_timeout(),
        max_log_length: usize::try_from(config.max_log_length).unwrap_or(usize::MAX),
        hard_timeout: config.hard_timeout(),
        log_silence_timeout: config.log_silence_timeout(),
    };
    let pool = Arc::new(ProcessorPool::new(
        Arc::new(conn),
        provider,
        generator,
        settings,
    ));

    spawn_signal_handler(Arc::clone(&pool));
    pool.run(config.pool_size, &config.queue_name).await?;
    Ok(0)
}

fn print_providers() -> i32 {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for registration in registry::registrations() {
        writeln!(out, "{} ({})", registration.name, registration.label).ok();
        for (key, description) in registration.help {
            writeln!(out, "  {key}: {description}").ok();
        }
        writeln!(out).ok();
    }
    0
}

fn spawn_signal_handler(pool: Arc<ProcessorPool>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        pool.graceful_shutdown();
        shutdown_signal().await;
        pool.hard_shutdown();
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "couldn't install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
