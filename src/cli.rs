use clap::Parser;
use eyre::eyre;
use exitstack::MockServiceConfig;
use std::net::IpAddr;
use std::time::Duration;

use super::Result;

/// Runs a mock service for tests and tears it down on exit
#[derive(Parser, Debug)]
#[command(name = "mock-service")]
#[command(about = "Runs a mock service for tests and tears it down on exit")]
#[command(version)]
pub struct Cli {
    /// Service to mock (e.g. s3, sqs, dynamodb)
    #[arg(long)]
    pub service: String,

    /// Port to serve on (default: a free port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind (default: address of eth0/en0, else loopback)
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Mock server executable
    #[arg(long, default_value = "moto_server")]
    pub server: String,

    /// Mock server argument; {service}, {host} and {port} are substituted (repeatable)
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    pub server_args: Vec<String>,

    /// Path probed to check the server is up
    #[arg(long, default_value = "/static/")]
    pub health_path: String,

    /// Number of health probes before giving up
    #[arg(long, default_value = "10")]
    pub start_attempts: u32,

    /// Delay between health probes (ms)
    #[arg(long, default_value = "500")]
    pub poll_interval_ms: u64,

    /// Timeout of a single health probe (ms)
    #[arg(long, default_value = "500")]
    pub probe_timeout_ms: u64,

    /// Graceful shutdown timeout (seconds)
    #[arg(long, default_value = "5")]
    pub shutdown_timeout_secs: u64,

    /// Command to run against the service
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Configuration of one mock-service session
#[derive(Debug, Clone)]
pub struct Config {
    /// The mock service to run
    pub service: MockServiceConfig,
    /// Program and arguments to run with the endpoint exported
    pub command: Option<(String, Vec<String>)>,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let bind_address = match cli.bind_addr {
            Some(addr) => Some(
                addr.parse::<IpAddr>()
                    .map_err(|e| eyre!("Invalid bind address '{}': {}", addr, e))?,
            ),
            None => None,
        };

        if cli.start_attempts == 0 {
            return Err(eyre!("--start-attempts must be at least 1"));
        }

        let mut service = MockServiceConfig {
            port: cli.port,
            bind_address,
            command: cli.server,
            health_path: cli.health_path,
            start_attempts: cli.start_attempts,
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            probe_timeout: Duration::from_millis(cli.probe_timeout_ms),
            shutdown_timeout: Duration::from_secs(cli.shutdown_timeout_secs),
            ..MockServiceConfig::new(cli.service)
        };
        if !cli.server_args.is_empty() {
            service.args = cli.server_args;
        }

        let mut command = cli.command.into_iter();
        let command = command.next().map(|program| (program, command.collect()));

        Ok(Config { service, command })
    }
}
