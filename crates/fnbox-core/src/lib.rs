//! Execution engine for running user-supplied functions inside pooled
//! Docker sandboxes.
//!
//! A function is a piece of Python or JavaScript source exposing a `main`
//! entry point. The engine keeps at most one sandbox per function, wraps the
//! source in a launcher that reads its input from the `INPUT` environment
//! variable and prints a delimited result block, installs and runs that
//! launcher under a timeout, and reports one metrics record per attempt.
//!
//! # Modules
//!
//! - **engine**: the `execute` pipeline, deletion and shutdown
//! - **pool**: per-function sandbox reuse and the exclusive section
//! - **wrapper**: launcher templates for each language
//! - **transfer**: tar packaging of a launcher into a sandbox
//! - **extractor**: parsing the result block out of captured output
//! - **metrics**: timing and resource usage from runtime stats
//! - **runtime**: the `SandboxRuntime` seam and its Docker implementation
//! - **registry**: function lookup and metrics sink
//! - **config**: YAML configuration and environment overrides

pub mod config;
pub mod core_types;
pub mod engine;
pub mod errors;
pub mod extractor;
pub mod language;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod transfer;
pub mod wrapper;

pub use config::{ConfigLoader, EngineConfig};
pub use core_types::{ExecutionMetrics, ExecutionStatus, FunctionRecord, ResultEnvelope};
pub use engine::ExecutionEngine;
pub use errors::{ConfigError, EngineError, FailureKind, SandboxRuntimeError};
pub use language::Language;
pub use pool::CleanupReport;
pub use registry::{FunctionRegistry, InMemoryRegistry};
pub use runtime::{DockerRuntime, SandboxRuntime};
