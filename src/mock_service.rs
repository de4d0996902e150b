//! Lifecycle wrapper around an external mock-service process.
//!
//! A [`MockService`] launches the mock server executable (by default moto's
//! `moto_server`), waits until it answers HTTP, and stops it again. Services
//! are shared per name within the process: entering a second instance with
//! the same name reuses the running server and the server stops when its
//! last holder exits.

use crate::environment::{endpoint_env_var, Environment};
use crate::exit_error::ExitError;
use crate::exit_stack::{AsyncScope, AsyncScopedExit, ExitStack};
use crate::port_manager::{reserve_port, resolve_bind_address, PortReservation};
use crate::process_manager::{ProcessConfig, ProcessManager};
use crate::Result;
use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Default executable of the moto server.
pub const DEFAULT_COMMAND: &str = "moto_server";

/// Default argument template; see [`MockServiceConfig::args`].
pub const DEFAULT_ARGS: [&str; 5] = ["{service}", "-H", "{host}", "-p", "{port}"];

/// Path moto serves static content from; any HTTP answer means "up".
pub const DEFAULT_HEALTH_PATH: &str = "/static/";

/// Running services by name.
static SERVICES: Lazy<Mutex<HashMap<String, RunningService>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

struct RunningService {
    endpoint: MockEndpoint,
    refcount: usize,
    process: ProcessManager,
}

/// Configuration for a mock service
#[derive(Debug, Clone)]
pub struct MockServiceConfig {
    /// Service to mock, e.g. `s3`; also the sharing key
    pub service_name: String,
    /// Mock server executable
    pub command: String,
    /// Arguments; `{service}`, `{host}` and `{port}` are substituted at start
    pub args: Vec<String>,
    /// Fixed port; a free port is reserved when unset
    pub port: Option<u16>,
    /// Address to bind; the local interface address when unset
    pub bind_address: Option<IpAddr>,
    /// Path probed to decide the server is up
    pub health_path: String,
    /// Number of health probes before giving up
    pub start_attempts: u32,
    /// Delay between health probes
    pub poll_interval: Duration,
    /// Timeout of a single health probe
    pub probe_timeout: Duration,
    /// Time allowed for a graceful stop before SIGKILL
    pub shutdown_timeout: Duration,
    /// Extra environment for the server process
    pub environment: Environment,
}

impl MockServiceConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }
}

impl Default for MockServiceConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            command: DEFAULT_COMMAND.to_string(),
            args: DEFAULT_ARGS.iter().map(|arg| arg.to_string()).collect(),
            port: None,
            bind_address: None,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            start_attempts: 10,
            poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
            environment: Environment::new(),
        }
    }
}

/// Where a running mock service can be reached.
#[derive(Debug, Clone, PartialEq)]
pub struct MockEndpoint {
    pub service_name: String,
    pub host: IpAddr,
    pub port: u16,
}

impl MockEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// The `{service}_mock_endpoint_url` variable pointing at this endpoint.
    pub fn environment(&self) -> Environment {
        let mut env = Environment::new();
        env.set(endpoint_env_var(&self.service_name), self.url());
        env
    }
}

/// Handle to one use of a shared mock service.
///
/// Implements [`AsyncScope`], so it is normally entered through an
/// [`ExitStack`]:
///
/// ```no_run
/// use exitstack::{ExitStack, MockService, MockServiceConfig};
///
/// # async fn demo() -> eyre::Result<()> {
/// let mut stack = ExitStack::new();
/// let endpoint = stack
///     .enter_async_scope(MockService::new(MockServiceConfig::new("s3"))?)
///     .await?;
/// println!("s3 mock at {}", endpoint.url());
/// stack.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MockService {
    config: MockServiceConfig,
    endpoint: MockEndpoint,
    reservation: Option<PortReservation>,
    entered: bool,
}

impl MockService {
    /// Resolves the bind address and reserves a port.
    ///
    /// Nothing is started until the service is entered.
    pub fn new(config: MockServiceConfig) -> Result<Self> {
        if config.service_name.is_empty() {
            return Err(eyre!("Mock service name must not be empty"));
        }

        let host = resolve_bind_address(config.bind_address);
        let (port, reservation) = match config.port {
            Some(port) => (port, None),
            None => {
                let reservation = reserve_port(host)?;
                (reservation.port(), Some(reservation))
            }
        };

        Ok(Self {
            endpoint: MockEndpoint {
                service_name: config.service_name.clone(),
                host,
                port,
            },
            config,
            reservation,
            entered: false,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// URL this instance's server listens on once started.
    pub fn endpoint_url(&self) -> String {
        self.endpoint.url()
    }

    /// Number of live holders of the service called `service_name`.
    pub async fn refcount(service_name: &str) -> usize {
        SERVICES
            .lock()
            .await
            .get(service_name)
            .map_or(0, |running| running.refcount)
    }

    /// Starts the service, runs `body` against it and stops it again,
    /// whatever `body` returned.
    pub async fn run<F, Fut, T>(self, body: F) -> Result<T>
    where
        F: FnOnce(MockEndpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut stack = ExitStack::new();
        let endpoint = stack.enter_async_scope(self).await?;
        let outcome = body(endpoint).await.map_err(ExitError::from);
        match stack.finish(outcome).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(eyre!("Mock service suppressed the body's error")),
            Err(e) => Err(e.into()),
        }
    }

    fn process_config(&self) -> ProcessConfig {
        let port = self.endpoint.port.to_string();
        let host = self.endpoint.host.to_string();
        let args = self
            .config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{service}", &self.config.service_name)
                    .replace("{host}", &host)
                    .replace("{port}", &port)
            })
            .collect();

        ProcessConfig {
            command: self.config.command.clone(),
            args,
            graceful_shutdown_timeout: self.config.shutdown_timeout,
            working_directory: None,
            environment: self.config.environment.clone(),
        }
    }

    async fn start(&mut self) -> Result<ProcessManager> {
        let mut process = ProcessManager::new(self.process_config());

        // release right before the server binds the port
        if let Some(mut reservation) = self.reservation.take() {
            reservation.release();
        }
        process.spawn_process().await?;

        for attempt in 1..=self.config.start_attempts {
            if let Some(status) = process.try_exit_status()? {
                warn!(
                    "Mock service {} exited during startup: {:?}",
                    self.config.service_name, status
                );
                break;
            }

            match self.probe().await {
                Ok(()) => {
                    info!(
                        "Mock service {} ready at {}",
                        self.config.service_name,
                        self.endpoint.url()
                    );
                    return Ok(process);
                }
                Err(e) => {
                    debug!(
                        "Health probe {}/{} for {} failed: {}",
                        attempt, self.config.start_attempts, self.config.service_name, e
                    );
                    if attempt < self.config.start_attempts {
                        sleep(self.config.poll_interval).await;
                    }
                }
            }
        }

        if let Err(e) = stop_process(&self.config.service_name, &mut process).await {
            warn!("Cleanup after failed start failed: {}", e);
        }
        Err(eyre!("Can not start service: {}", self.config.service_name))
    }

    /// One `GET` of the health path; any HTTP response counts as healthy.
    async fn probe(&self) -> Result<()> {
        let addr = (self.endpoint.host, self.endpoint.port);
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.config.health_path,
            self.endpoint.url().trim_start_matches("http://")
        );

        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(request.as_bytes()).await?;
            let mut status_line = [0u8; 5];
            stream.read_exact(&mut status_line).await?;
            Ok::<_, std::io::Error>(status_line)
        };

        let status_line = timeout(self.config.probe_timeout, exchange)
            .await
            .wrap_err("Health probe timed out")??;
        if &status_line == b"HTTP/" {
            Ok(())
        } else {
            Err(eyre!("Unexpected health probe response"))
        }
    }
}

async fn stop_process(service_name: &str, process: &mut ProcessManager) -> Result<()> {
    info!("Stopping mock service {}", service_name);
    process.graceful_shutdown().await.map_err(|e| {
        error!("Error stopping mock service {}: {}", service_name, e);
        e
    })
}

#[async_trait]
impl AsyncScope for MockService {
    type Entered = MockEndpoint;

    async fn enter(&mut self) -> Result<MockEndpoint> {
        if self.entered {
            return Err(eyre!(
                "Mock service {} entered twice",
                self.config.service_name
            ));
        }

        let mut services = SERVICES.lock().await;
        if let Some(running) = services.get_mut(&self.config.service_name) {
            running.refcount += 1;
            debug!(
                "Reusing mock service {} (refcount {})",
                self.config.service_name, running.refcount
            );
            // not ours to start: give the reserved port back
            self.reservation = None;
            self.endpoint = running.endpoint.clone();
            self.entered = true;
            return Ok(running.endpoint.clone());
        }

        let process = self.start().await?;
        services.insert(
            self.config.service_name.clone(),
            RunningService {
                endpoint: self.endpoint.clone(),
                refcount: 1,
                process,
            },
        );
        self.entered = true;
        Ok(self.endpoint.clone())
    }
}

#[async_trait]
impl AsyncScopedExit for MockService {
    async fn exit(&mut self, _pending: Option<&ExitError>) -> Result<bool> {
        if !std::mem::take(&mut self.entered) {
            return Ok(false);
        }

        let mut services = SERVICES.lock().await;
        let Some(running) = services.get_mut(&self.config.service_name) else {
            return Err(eyre!(
                "Mock service {} is not running",
                self.config.service_name
            ));
        };

        running.refcount -= 1;
        if running.refcount > 0 {
            debug!(
                "Mock service {} still held (refcount {})",
                self.config.service_name, running.refcount
            );
            return Ok(false);
        }

        if let Some(mut running) = services.remove(&self.config.service_name) {
            stop_process(&self.config.service_name, &mut running.process).await?;
        }
        Ok(false)
    }
}
