//! Function registry collaborator.
//!
//! The engine looks functions up and hands every metrics record to a
//! `FunctionRegistry`. Durable storage lives outside this crate;
//! `InMemoryRegistry` serves the CLI and tests.

use crate::core_types::{ExecutionMetrics, FunctionRecord};
use crate::errors::EngineError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    async fn lookup(&self, function_id: &str) -> Result<Option<FunctionRecord>, EngineError>;

    async fn record_metrics(
        &self,
        function_id: &str,
        metrics: &ExecutionMetrics,
    ) -> Result<(), EngineError>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    functions: RwLock<HashMap<String, FunctionRecord>>,
    metrics: RwLock<HashMap<String, Vec<ExecutionMetrics>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a function; returns the previous record.
    pub async fn register(&self, record: FunctionRecord) -> Option<FunctionRecord> {
        self.functions.write().await.insert(record.id.clone(), record)
    }

    /// Forgets a function and its metrics history.
    pub async fn remove(&self, function_id: &str) -> Option<FunctionRecord> {
        self.metrics.write().await.remove(function_id);
        self.functions.write().await.remove(function_id)
    }

    pub async fn list(&self) -> Vec<FunctionRecord> {
        let mut records: Vec<_> = self.functions.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Metrics history for a function, newest first.
    pub async fn metrics_for(&self, function_id: &str) -> Vec<ExecutionMetrics> {
        let mut history = self
            .metrics
            .read()
            .await
            .get(function_id)
            .cloned()
            .unwrap_or_default();
        history.reverse();
        history
    }
}

#[async_trait]
impl FunctionRegistry for InMemoryRegistry {
    async fn lookup(&self, function_id: &str) -> Result<Option<FunctionRecord>, EngineError> {
        Ok(self.functions.read().await.get(function_id).cloned())
    }

    async fn record_metrics(
        &self,
        function_id: &str,
        metrics: &ExecutionMetrics,
    ) -> Result<(), EngineError> {
        self.metrics
            .write()
            .await
            .entry(function_id.to_string())
            .or_default()
            .push(metrics.clone());
        Ok(())
    }
}
