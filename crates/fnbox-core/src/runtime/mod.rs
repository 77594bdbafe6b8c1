//! Sandbox runtime collaborator.
//!
//! The engine only talks to sandboxes through `SandboxRuntime`. The Docker
//! implementation lives in `docker`; tests substitute a scripted double.

pub mod docker;

use crate::errors::SandboxRuntimeError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

pub use docker::DockerRuntime;

/// Memory ceiling and CPU quota applied to every sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
}

impl ResourceLimits {
    /// `cpu_fraction` is a share of one core, e.g. 0.5 for half a core.
    pub fn new(memory_bytes: i64, cpu_fraction: f64, cpu_period: i64) -> Self {
        Self {
            memory_bytes,
            cpu_period,
            cpu_quota: (cpu_fraction * cpu_period as f64).round() as i64,
        }
    }
}

/// Everything needed to provision one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub limits: ResourceLimits,
    pub keepalive_command: Vec<String>,
    pub labels: HashMap<String, String>,
    pub network_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    /// Combined stdout and stderr in arrival order.
    pub output: String,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), SandboxRuntimeError>;

    /// Create and start a sandbox running the keepalive command; returns its id.
    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxRuntimeError>;

    /// Look a sandbox up by name or id. `Ok(None)` when it does not exist.
    async fn get(&self, name_or_id: &str) -> Result<Option<SandboxInfo>, SandboxRuntimeError>;

    /// Every sandbox, running or not, carrying `label` set to `value`.
    async fn list(&self, label: &str, value: &str) -> Result<Vec<SandboxInfo>, SandboxRuntimeError>;

    /// Stop a sandbox. Already stopped or missing sandboxes are not an error.
    async fn stop(&self, id: &str) -> Result<(), SandboxRuntimeError>;

    /// Remove a sandbox. Missing sandboxes are not an error.
    async fn remove(&self, id: &str) -> Result<(), SandboxRuntimeError>;

    /// Unpack a tar archive into `target_dir` inside the sandbox.
    async fn put_archive(
        &self,
        id: &str,
        target_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxRuntimeError>;

    /// Run a command to completion, capturing combined output and exit code.
    async fn exec(
        &self,
        id: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput, SandboxRuntimeError>;

    /// Kill every process in the sandbox except its keepalive.
    async fn kill_running(&self, id: &str) -> Result<(), SandboxRuntimeError>;

    /// One stats document with a current and a previous CPU sample.
    async fn stats(&self, id: &str) -> Result<Value, SandboxRuntimeError>;
}
