type Result<T> = color_eyre::eyre::Result<T>;

mod cli;
mod signals;

use clap::Parser;
use exitstack::{ExitError, ExitStack, MockEndpoint, MockService, ProcessConfig, ProcessManager};
use tokio::select;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config};
use signals::ShutdownSignals;

/// Exit code reported when a signal ends the session
const SIGNAL_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    let code = run_session(config).await?;

    info!("mock-service exiting with code {}", code);
    std::process::exit(code);
}

/// Starts the service, runs the session body and unwinds everything.
async fn run_session(config: Config) -> Result<i32> {
    let mut signals = ShutdownSignals::new()?;
    let mut stack = ExitStack::new();

    let endpoint = stack
        .enter_async_scope(MockService::new(config.service)?)
        .await?;

    let outcome = match config.command {
        Some((program, args)) => run_command(program, args, &endpoint, &mut signals).await,
        None => wait_for_shutdown(&endpoint, &mut signals).await,
    };

    let code = stack.finish(outcome.map_err(ExitError::from)).await?;
    Ok(code.unwrap_or(1))
}

async fn wait_for_shutdown(endpoint: &MockEndpoint, signals: &mut ShutdownSignals) -> Result<i32> {
    println!("{}", endpoint.url());
    for (key, value) in endpoint.environment().iter() {
        println!("export {}={}", key, value);
    }

    let signal = signals.recv().await;
    info!("received {}, shutting down", signal);
    Ok(0)
}

/// Runs `program` with the endpoint variable exported and returns its exit code.
async fn run_command(
    program: String,
    args: Vec<String>,
    endpoint: &MockEndpoint,
    signals: &mut ShutdownSignals,
) -> Result<i32> {
    let mut process = ProcessManager::new(ProcessConfig {
        command: program,
        args,
        environment: endpoint.environment(),
        ..Default::default()
    });
    process.spawn_process().await?;

    select! {
        exit_status = process.wait_for_exit() => {
            let code = exit_status?.and_then(|status| status.code()).unwrap_or(1);
            Ok(code)
        }
        signal = signals.recv() => {
            warn!("received {}, stopping command", signal);
            process.graceful_shutdown().await?;
            Ok(SIGNAL_EXIT_CODE)
        }
    }
}
