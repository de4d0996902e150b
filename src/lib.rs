//! Helpers for test environments.
//!
//! [`ExitStack`] registers cleanup actions as resources are acquired and
//! unwinds them in reverse order, chaining failures the way nested scoped
//! blocks would. [`MockService`] runs an external mock-service process as a
//! resource such a stack can guard.

pub type Result<T> = color_eyre::eyre::Result<T>;

mod environment;
mod exit_error;
mod exit_stack;
mod mock_service;
mod port_manager;
mod process_manager;

pub use environment::{endpoint_env_var, resolve_endpoint_url, Environment};
pub use exit_error::ExitError;
pub use exit_stack::{AsyncScope, AsyncScopedExit, ExitStack, Scope, ScopedExit};
pub use mock_service::{MockEndpoint, MockService, MockServiceConfig};
pub use port_manager::{free_tcp_port, local_ip_address, reserve_port, PortReservation};
pub use process_manager::{ProcessConfig, ProcessInfo, ProcessManager, ProcessState};
