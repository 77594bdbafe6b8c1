//! Records exchanged between the engine and its callers.

use crate::errors::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A registered function as handed to the engine. The engine never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub code: String,
    pub language: String,
    /// Timeout in seconds; zero falls back to the engine default.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
}

impl FunctionRecord {
    pub fn new(id: impl Into<String>, language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            code: code.into(),
            language: language.into(),
            timeout: 0,
            environment_variables: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = timeout_secs;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one execution as seen by the caller.
///
/// Serializes to the same shape as the launcher's payload line:
/// `{"result": ...}` or `{"error": {"kind": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ResultEnvelope {
    #[serde(rename = "result")]
    Value(Value),
    #[serde(rename = "error")]
    Failure { kind: FailureKind, message: String },
}

impl ResultEnvelope {
    pub fn runtime_error(message: impl Into<String>) -> Self {
        ResultEnvelope::Failure {
            kind: FailureKind::Runtime,
            message: message.into(),
        }
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        ResultEnvelope::Failure {
            kind: FailureKind::Timeout,
            message: format!("Function execution timed out after {} seconds", timeout_secs),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultEnvelope::Value(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ResultEnvelope::Value(v) => Some(v),
            ResultEnvelope::Failure { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ResultEnvelope::Value(_) => None,
            ResultEnvelope::Failure { message, .. } => Some(message),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ResultEnvelope::Value(_) => None,
            ResultEnvelope::Failure { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// Resource accounting for a single execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub function_id: String,
    /// Wall-clock seconds.
    pub execution_time: f64,
    /// Resident memory in MB.
    pub memory_usage: f64,
    /// CPU utilisation in percent.
    pub cpu_usage: f64,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionMetrics {
    pub fn mark_failure(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.status = ExecutionStatus::Failure;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
