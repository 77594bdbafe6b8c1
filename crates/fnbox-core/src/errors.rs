//! Error types for the execution engine
//!
//! Errors are split by where they originate: the sandbox runtime collaborator
//! (`SandboxRuntimeError`), the engine's own execution pipeline (`EngineError`),
//! configuration loading (`ConfigError`) and metrics computation
//! (`MetricsWarning`, which is never propagated past the metrics module).
//!
//! A failing user function is not an error at this level. It is reported as a
//! `ResultEnvelope::Failure` and carries a `FailureKind` instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification attached to failed executions, both in the result envelope
/// and in the recorded metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The user function raised or otherwise reported an error.
    Runtime,
    /// The invocation exceeded the function's timeout and was killed.
    Timeout,
    /// The launcher could not be installed into the sandbox.
    Transfer,
    /// No sandbox could be provisioned.
    Creation,
    /// The runtime failed to run the launcher at all.
    Invocation,
    /// The function record could not be executed as given.
    Rejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Runtime => "runtime",
            FailureKind::Timeout => "timeout",
            FailureKind::Transfer => "transfer",
            FailureKind::Creation => "creation",
            FailureKind::Invocation => "invocation",
            FailureKind::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

// Errors raised by a sandbox runtime implementation
#[derive(Error, Debug)]
pub enum SandboxRuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Sandbox '{0}' not found")]
    NotFound(String),
    #[error("I/O error during sandbox operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Stats could not be encoded: {0}")]
    StatsEncoding(#[from] serde_json::Error),
    #[error("Runtime rejected the request: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to create sandbox for function '{function_id}': {source}")]
    SandboxCreation {
        function_id: String,
        #[source]
        source: SandboxRuntimeError,
    },
    #[error("Failed to install launcher into sandbox {sandbox_id}: {source}")]
    SandboxTransfer {
        sandbox_id: String,
        #[source]
        source: SandboxRuntimeError,
    },
    #[error("Failed to invoke launcher in sandbox {sandbox_id}: {source}")]
    SandboxInvocation {
        sandbox_id: String,
        #[source]
        source: SandboxRuntimeError,
    },
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Function '{0}' not found")]
    FunctionNotFound(String),
    #[error("Could not serialize function input: {0}")]
    InputSerialization(#[from] serde_json::Error),
    #[error("Registry error: {0}")]
    Registry(String),
}

impl EngineError {
    /// The failure kind recorded in metrics when this error aborts an attempt.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::SandboxCreation { .. } => FailureKind::Creation,
            EngineError::SandboxTransfer { .. } => FailureKind::Transfer,
            EngineError::SandboxInvocation { .. } => FailureKind::Invocation,
            EngineError::UnsupportedLanguage(_)
            | EngineError::FunctionNotFound(_)
            | EngineError::InputSerialization(_)
            | EngineError::Registry(_) => FailureKind::Rejected,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Non-fatal problems met while deriving metrics from runtime stats.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsWarning {
    #[error("stats are missing field {0}")]
    MissingField(&'static str),
    #[error("total CPU delta between samples is zero")]
    ZeroSystemDelta,
    #[error("runtime stats unavailable")]
    Unavailable,
}
