//! Execution metrics derived from wall-clock timing and runtime stats.
//!
//! Stats are taken as the runtime's JSON stats document (Docker's
//! `/containers/{id}/stats` shape), which carries the current sample in
//! `cpu_stats` and the previous one in `precpu_stats`. Anything missing or
//! inconsistent yields zero for that figure and a logged warning; metrics
//! computation never fails an execution.

use crate::core_types::{ExecutionMetrics, ExecutionStatus};
use crate::errors::MetricsWarning;
use chrono::Utc;
use serde_json::Value;
use std::time::Instant;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn compute(
    function_id: &str,
    start_time: Instant,
    end_time: Instant,
    runtime_stats: Option<&Value>,
) -> ExecutionMetrics {
    let execution_time = end_time.saturating_duration_since(start_time).as_secs_f64();

    let (memory_usage, cpu_usage) = match runtime_stats {
        Some(stats) => (
            or_zero("memory", memory_usage_mb(stats)),
            or_zero("CPU", cpu_usage_percent(stats)),
        ),
        None => {
            log::debug!("{} for function {}", MetricsWarning::Unavailable, function_id);
            (0.0, 0.0)
        }
    };

    ExecutionMetrics {
        function_id: function_id.to_string(),
        execution_time,
        memory_usage,
        cpu_usage,
        status: ExecutionStatus::Success,
        error_kind: None,
        error_message: None,
        timestamp: Utc::now(),
    }
}

fn or_zero(figure: &str, value: Result<f64, MetricsWarning>) -> f64 {
    value.unwrap_or_else(|warning| {
        log::warn!("Could not compute {} usage: {}", figure, warning);
        0.0
    })
}

pub fn memory_usage_mb(stats: &Value) -> Result<f64, MetricsWarning> {
    let usage = counter(stats, "/memory_stats/usage", "memory_stats.usage")?;
    Ok(usage as f64 / BYTES_PER_MB)
}

/// `(used_cpu_delta / total_cpu_delta) * 100` between the two samples.
pub fn cpu_usage_percent(stats: &Value) -> Result<f64, MetricsWarning> {
    let total = counter(stats, "/cpu_stats/cpu_usage/total_usage", "cpu_stats.cpu_usage.total_usage")?;
    let pre_total = counter(
        stats,
        "/precpu_stats/cpu_usage/total_usage",
        "precpu_stats.cpu_usage.total_usage",
    )?;
    let system = counter(stats, "/cpu_stats/system_cpu_usage", "cpu_stats.system_cpu_usage")?;
    let pre_system = counter(
        stats,
        "/precpu_stats/system_cpu_usage",
        "precpu_stats.system_cpu_usage",
    )?;

    let used_delta = total as f64 - pre_total as f64;
    let total_delta = system as f64 - pre_system as f64;
    if total_delta <= 0.0 {
        return Err(MetricsWarning::ZeroSystemDelta);
    }

    Ok(((used_delta / total_delta) * 100.0).clamp(0.0, 100.0))
}

fn counter(stats: &Value, pointer: &str, name: &'static str) -> Result<u64, MetricsWarning> {
    stats
        .pointer(pointer)
        .and_then(Value::as_u64)
        .ok_or(MetricsWarning::MissingField(name))
}
