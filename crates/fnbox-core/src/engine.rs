//! The execution engine: one call in, one envelope and one metrics record out.
//!
//! For every attempt the engine resolves a sandbox from the pool, installs a
//! freshly rendered launcher, runs it under the function's timeout, extracts
//! the result block and reads runtime stats, all inside the function's
//! exclusive section. The metrics record is then handed to the registry,
//! outside the section, before anything is returned.
//!
//! Sandbox creation, launcher transfer and exec API failures are engine
//! errors. A user function that raised or timed out is a normal outcome,
//! returned as `ResultEnvelope::Failure`.

use crate::config::EngineConfig;
use crate::core_types::{ExecutionMetrics, FunctionRecord, ResultEnvelope};
use crate::errors::{ConfigError, EngineError, MetricsWarning};
use crate::extractor;
use crate::language::Language;
use crate::metrics;
use crate::pool::{CleanupReport, PoolSettings, SandboxHandle, SandboxPool};
use crate::registry::FunctionRegistry;
use crate::runtime::SandboxRuntime;
use crate::transfer;
use crate::wrapper::{self, Launcher, INPUT_ENV_VAR};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

// Exit statuses of coreutils `timeout` when it had to kill the command.
const TIMEOUT_EXIT_CODES: [i64; 2] = [124, 137];

pub struct ExecutionEngine {
    runtime: Arc<dyn SandboxRuntime>,
    registry: Arc<dyn FunctionRegistry>,
    pool: SandboxPool,
    config: EngineConfig,
}

struct Invocation {
    envelope: ResultEnvelope,
    finished_at: Instant,
    stats: Option<Value>,
}

impl ExecutionEngine {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        registry: Arc<dyn FunctionRegistry>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let settings = PoolSettings::from_config(&config)?;
        Ok(Self {
            pool: SandboxPool::new(runtime.clone(), settings),
            runtime,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Functions that currently have a sandbox slot in the pool.
    pub fn function_ids(&self) -> Vec<String> {
        self.pool.function_ids()
    }

    /// Runs `record` with `input_payload`. Returns an engine error only when
    /// the sandbox could not be provisioned, loaded or invoked; a metrics
    /// record is reported to the registry in every case.
    pub async fn execute(
        &self,
        function_id: &str,
        record: &FunctionRecord,
        input_payload: &Value,
    ) -> Result<(ResultEnvelope, ExecutionMetrics), EngineError> {
        let execution_id = Uuid::new_v4();
        log::info!(
            "Executing function {} ({}) [{}]",
            function_id,
            record.language,
            execution_id
        );

        let start = Instant::now();
        let (outcome, metrics) = match self.run(function_id, record, input_payload).await {
            Ok(invocation) => {
                let mut metrics = metrics::compute(
                    function_id,
                    start,
                    invocation.finished_at,
                    invocation.stats.as_ref(),
                );
                if let ResultEnvelope::Failure { kind, message } = &invocation.envelope {
                    metrics.mark_failure(*kind, message.clone());
                }
                (Ok(invocation.envelope), metrics)
            }
            Err(e) => {
                log::error!("Execution [{}] of function {} failed: {}", execution_id, function_id, e);
                let mut metrics = metrics::compute(function_id, start, Instant::now(), None);
                metrics.mark_failure(e.failure_kind(), e.to_string());
                (Err(e), metrics)
            }
        };

        if let Err(e) = self.registry.record_metrics(function_id, &metrics).await {
            log::warn!("Could not record metrics for function {}: {}", function_id, e);
        }

        log::info!(
            "Execution [{}] of function {} finished: {:?} in {:.3}s",
            execution_id,
            function_id,
            metrics.status,
            metrics.execution_time
        );
        outcome.map(|envelope| (envelope, metrics))
    }

    /// Looks the function up in the registry, then executes it.
    pub async fn execute_registered(
        &self,
        function_id: &str,
        input_payload: &Value,
    ) -> Result<(ResultEnvelope, ExecutionMetrics), EngineError> {
        let record = self
            .registry
            .lookup(function_id)
            .await?
            .ok_or_else(|| EngineError::FunctionNotFound(function_id.to_string()))?;
        self.execute(function_id, &record, input_payload).await
    }

    /// Tears down the function's sandbox. Safe to call repeatedly.
    pub async fn delete(&self, function_id: &str) {
        self.pool.cleanup(function_id).await;
    }

    pub async fn shutdown(&self) -> CleanupReport {
        self.shutdown_with_grace(self.config.shutdown_grace()).await
    }

    /// Removes every pooled sandbox, giving up after `grace`. Anything left
    /// behind is logged, not retried.
    pub async fn shutdown_with_grace(&self, grace: Duration) -> CleanupReport {
        log::info!("Shutting down execution engine (grace period {:?})", grace);
        match tokio::time::timeout(grace, self.pool.cleanup_all()).await {
            Ok(report) => {
                if !report.failed.is_empty() {
                    log::error!(
                        "Sandboxes for functions {:?} could not be removed and may still be running",
                        report.failed
                    );
                }
                log::info!(
                    "Removed {} sandbox(es) and {} untracked sandbox(es) during shutdown",
                    report.removed.len(),
                    report.orphans.len()
                );
                report
            }
            Err(_) => {
                let pending = self.pool.function_ids();
                log::error!(
                    "Shutdown grace period elapsed; sandboxes for functions {:?} may still be running",
                    pending
                );
                CleanupReport {
                    failed: pending,
                    ..CleanupReport::default()
                }
            }
        }
    }

    /// Id of the sandbox currently pooled for a function.
    pub async fn sandbox_id(&self, function_id: &str) -> Option<String> {
        self.pool.sandbox_id(function_id).await
    }

    fn timeout_for(&self, record: &FunctionRecord) -> u64 {
        if record.timeout == 0 {
            self.config.default_timeout_secs
        } else {
            record.timeout
        }
    }

    async fn run(
        &self,
        function_id: &str,
        record: &FunctionRecord,
        input_payload: &Value,
    ) -> Result<Invocation, EngineError> {
        let language: Language = record.language.parse()?;
        let launcher = wrapper::wrap(language, &record.code, input_payload)?;
        let timeout_secs = self.timeout_for(record);

        let mut lease = self.pool.lease(function_id).await;
        let handle = lease.acquire(language).await?;
        let path = transfer::install_launcher(
            self.runtime.as_ref(),
            &handle,
            &launcher,
            &self.config.launcher_dir,
        )
        .await?;

        let envelope = self
            .invoke(&handle, &launcher, &path, record, timeout_secs)
            .await?;
        let finished_at = Instant::now();

        let stats = match self.runtime.stats(handle.sandbox_id()).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::warn!("{} for sandbox {}: {}", MetricsWarning::Unavailable, handle.sandbox_id(), e);
                None
            }
        };

        drop(lease);
        Ok(Invocation {
            envelope,
            finished_at,
            stats,
        })
    }

    async fn invoke(
        &self,
        handle: &SandboxHandle,
        launcher: &Launcher,
        path: &str,
        record: &FunctionRecord,
        timeout_secs: u64,
    ) -> Result<ResultEnvelope, EngineError> {
        let command = invocation_command(launcher.language, path, timeout_secs);
        let env = invocation_env(record, launcher);
        let deadline =
            Duration::from_secs(timeout_secs.saturating_add(self.config.timeout_grace_secs));

        let started = Instant::now();
        let exec = self.runtime.exec(handle.sandbox_id(), &command, &env);
        let output = match tokio::time::timeout(deadline, exec).await {
            Ok(result) => result.map_err(|source| EngineError::SandboxInvocation {
                sandbox_id: handle.sandbox_id().to_string(),
                source,
            })?,
            Err(_) => {
                log::warn!(
                    "Function {} exceeded its {}s timeout; killing its command in sandbox {}",
                    handle.function_id(),
                    timeout_secs,
                    handle.sandbox_id()
                );
                if let Err(e) = self.runtime.kill_running(handle.sandbox_id()).await {
                    log::warn!("Could not kill command in sandbox {}: {}", handle.sandbox_id(), e);
                }
                return Ok(ResultEnvelope::timeout(timeout_secs));
            }
        };

        // A kill after the deadline is a timeout even when the output holds a
        // block; the launcher never printed it.
        let extraction = extractor::extract_detailed(&output.output);
        if output.exit_code.is_some_and(|code| TIMEOUT_EXIT_CODES.contains(&code))
            && started.elapsed() >= Duration::from_secs(timeout_secs)
        {
            log::warn!(
                "Function {} was killed after its {}s timeout",
                handle.function_id(),
                timeout_secs
            );
            return Ok(ResultEnvelope::timeout(timeout_secs));
        }

        if let Some(code) = output.exit_code.filter(|code| *code != 0) {
            log::debug!("Launcher for function {} exited with {}", handle.function_id(), code);
        }
        Ok(extraction.envelope)
    }
}

/// `timeout -s KILL <n>s <interpreter...> <launcher>`; the launcher path is
/// passed as an argument, never through a shell.
pub fn invocation_command(language: Language, launcher_path: &str, timeout_secs: u64) -> Vec<String> {
    let mut command = vec![
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        format!("{}s", timeout_secs),
    ];
    command.extend(language.interpreter().iter().map(|arg| arg.to_string()));
    command.push(launcher_path.to_string());
    command
}

/// The function's environment plus `INPUT`. A user-supplied `INPUT` is dropped.
pub fn invocation_env(record: &FunctionRecord, launcher: &Launcher) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = record
        .environment_variables
        .iter()
        .filter(|(key, _)| {
            if key.as_str() == INPUT_ENV_VAR {
                log::warn!(
                    "Ignoring environment variable {} on function {}; it carries the input payload",
                    INPUT_ENV_VAR,
                    record.id
                );
                false
            } else {
                true
            }
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    env.sort();
    env.push(launcher.input_env());
    env
}
