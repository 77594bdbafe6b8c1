//! Supported function languages.
//!
//! Every per-language decision (base image, interpreter, launcher file name,
//! keepalive process, code wrapper) hangs off this enum, so a new language is
//! one new variant plus one new wrapper.

use crate::errors::EngineError;
use crate::wrapper::{self, CodeWrapper};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::JavaScript];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }

    pub fn default_image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.10-slim",
            Language::JavaScript => "node:18-slim",
        }
    }

    /// Interpreter argv prefix; the launcher path is appended.
    pub fn interpreter(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &["python3", "-u"],
            Language::JavaScript => &["node"],
        }
    }

    /// Foreground process that keeps the sandbox alive between invocations.
    pub fn keepalive_command(&self) -> Vec<String> {
        match self {
            Language::Python | Language::JavaScript => {
                vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
            }
        }
    }

    pub fn launcher_filename(&self) -> String {
        format!("function.{}", self.wrapper().file_extension())
    }

    pub fn wrapper(&self) -> &'static dyn CodeWrapper {
        match self {
            Language::Python => &wrapper::python::PythonWrapper,
            Language::JavaScript => &wrapper::javascript::JavaScriptWrapper,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = EngineError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            _ => Err(EngineError::UnsupportedLanguage(tag.to_string())),
        }
    }
}
