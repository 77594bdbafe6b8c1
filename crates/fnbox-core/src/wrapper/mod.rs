//! Launcher generation for user functions.
//!
//! A launcher is a self-contained script that loads the user's source, reads
//! the JSON input from the `INPUT` environment variable, calls `main(input)`
//! and prints exactly one payload line between the result markers:
//!
//! ```text
//! ##RESULT_START##
//! {"result": <value>}        or        {"error": "<message>"}
//! ##RESULT_END##
//! ```
//!
//! User source is embedded as a JSON-escaped string literal, never spliced
//! into shell text, so quotes, newlines and shell metacharacters pass through
//! untouched. It is compiled at launcher start-up, which also routes syntax
//! errors through the error channel.

pub mod javascript;
pub mod python;

use crate::language::Language;
use serde_json::Value;

pub const RESULT_START_MARKER: &str = "##RESULT_START##";
pub const RESULT_END_MARKER: &str = "##RESULT_END##";
/// Environment variable carrying the serialized input payload.
pub const INPUT_ENV_VAR: &str = "INPUT";

/// Placeholder in launcher templates replaced by the user code literal.
pub(crate) const USER_CODE_PLACEHOLDER: &str = "__FNBOX_USER_CODE__";

pub trait CodeWrapper: Send + Sync {
    fn file_extension(&self) -> &'static str;

    /// Launcher template containing `USER_CODE_PLACEHOLDER` exactly once.
    fn template(&self) -> &'static str;

    fn render(&self, user_code: &str) -> Result<String, serde_json::Error> {
        let literal = serde_json::to_string(user_code)?;
        Ok(self.template().replacen(USER_CODE_PLACEHOLDER, &literal, 1))
    }
}

/// A rendered launcher ready for installation.
#[derive(Debug, Clone)]
pub struct Launcher {
    pub language: Language,
    pub filename: String,
    pub script: Vec<u8>,
    /// Serialized input, exposed to the launcher as `INPUT`.
    pub input: String,
}

impl Launcher {
    pub fn input_env(&self) -> (String, String) {
        (INPUT_ENV_VAR.to_string(), self.input.clone())
    }
}

pub fn wrap(
    language: Language,
    user_code: &str,
    input_payload: &Value,
) -> Result<Launcher, serde_json::Error> {
    let script = language.wrapper().render(user_code)?;
    Ok(Launcher {
        language,
        filename: language.launcher_filename(),
        script: script.into_bytes(),
        input: serde_json::to_string(input_payload)?,
    })
}
