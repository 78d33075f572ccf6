//! Sandboxed execution environments for testbed.
//!
//! This crate implements the execution layer: the `Environment` contract with
//! namespace (bubblewrap + nsenter), container (engine CLI with a long-lived
//! anchor container) and direct (host, no isolation) backends, uniform
//! `ProcessHandle` tracking, concurrent stdout/stderr capture, file transfer
//! across the isolation boundary, prerequisite checking, and scoped
//! acquisition with guaranteed teardown.

pub mod backend;
pub mod capture;
pub mod container;
pub mod direct;
pub mod docker;
pub mod environment;
pub mod handle;
pub mod lifecycle;
pub mod namespace;
pub mod prereq;
mod process;
pub mod workspace;

pub use backend::select_backend;
pub use capture::{OutputBuffer, StreamKind};
pub use container::{ContainerBackend, ContainerSpec};
pub use direct::DirectBackend;
pub use docker::{ContainerDelegate, ExecOutput, NetworkEndpoint};
pub use environment::{with_environment, Environment, EnvironmentGuard, Sandbox, TeardownReport};
pub use handle::{
    Invocation, ProcessHandle, ProcessId, ProcessState, KILLED_EXIT_CODE, UNKNOWN_EXIT_CODE,
};
pub use lifecycle::{validate_transition, EnvState};
pub use namespace::{NamespaceBackend, SandboxMount};
pub use prereq::{check_container_prereqs, check_namespace_prereqs, format_missing, MissingPrereq};
pub use workspace::Workspace;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] testbed_schema::ConfigError),
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("process '{process}' did not exit within {timeout:?}")]
    Timeout { process: String, timeout: Duration },
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("teardown step failed: {0}")]
    Teardown(String),
    #[error("invalid environment state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}
