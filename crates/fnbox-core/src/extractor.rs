//! Result extraction from captured launcher output.
//!
//! The combined stdout/stderr of an invocation is scanned line by line for
//! spans delimited by the result markers. The payload line of the last closed
//! span wins, so a function that prints the markers itself cannot shadow the
//! launcher's own block, which is always written last.

use crate::core_types::ResultEnvelope;
use crate::wrapper::{RESULT_END_MARKER, RESULT_START_MARKER};
use serde_json::Value;

/// Envelope plus whether it came from a marker block at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub envelope: ResultEnvelope,
    /// True when no marker block was found and the raw output became the result.
    pub degraded: bool,
}

pub fn extract(raw_output: &str) -> ResultEnvelope {
    extract_detailed(raw_output).envelope
}

pub fn extract_detailed(raw_output: &str) -> Extraction {
    match find_payload_line(raw_output) {
        Some(line) => Extraction {
            envelope: parse_payload(line),
            degraded: false,
        },
        None => {
            log::warn!(
                "No result block in function output ({} bytes); returning raw output",
                raw_output.len()
            );
            Extraction {
                envelope: ResultEnvelope::Value(Value::String(raw_output.to_string())),
                degraded: true,
            }
        }
    }
}

/// Last line inside the last closed marker span. Spans without content and
/// spans never closed by an end marker are ignored.
fn find_payload_line(raw_output: &str) -> Option<&str> {
    let mut in_span = false;
    let mut current: Option<&str> = None;
    let mut captured: Option<&str> = None;

    for line in raw_output.lines() {
        let trimmed = line.trim();
        if trimmed == RESULT_START_MARKER {
            in_span = true;
            current = None;
        } else if trimmed == RESULT_END_MARKER {
            if in_span {
                if let Some(line) = current.take() {
                    captured = Some(line);
                }
            }
            in_span = false;
        } else if in_span {
            current = Some(trimmed);
        }
    }

    captured
}

fn parse_payload(line: &str) -> ResultEnvelope {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("Result payload is not valid JSON ({}); returning it as text", e);
            return ResultEnvelope::Value(Value::String(line.to_string()));
        }
    };

    let mut fields = match parsed {
        Value::Object(fields) => fields,
        other => {
            log::warn!("Result payload is not an object; returning it unchanged");
            return ResultEnvelope::Value(other);
        }
    };

    match fields.remove("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(message)) => return ResultEnvelope::runtime_error(message),
        Some(other) => return ResultEnvelope::runtime_error(other.to_string()),
    }

    match fields.remove("result") {
        Some(value) => ResultEnvelope::Value(value),
        None => {
            log::warn!("Result payload has neither 'result' nor 'error'; returning it unchanged");
            ResultEnvelope::Value(Value::Object(fields))
        }
    }
}
