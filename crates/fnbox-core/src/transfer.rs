//! Launcher installation into a sandbox.
//!
//! The launcher travels as a single-entry tar archive uploaded through the
//! runtime's archive API. The entry is stored with mode 0755, so the file is
//! executable as soon as it lands and no follow-up `chmod` is needed.

use crate::errors::{EngineError, SandboxRuntimeError};
use crate::pool::SandboxHandle;
use crate::runtime::SandboxRuntime;
use crate::wrapper::Launcher;
use std::time::{SystemTime, UNIX_EPOCH};

const LAUNCHER_MODE: u32 = 0o755;

pub fn build_archive(filename: &str, contents: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(LAUNCHER_MODE);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, filename, contents)?;
    builder.into_inner()
}

/// Writes `launcher_bytes` to `<target_dir>/<filename>` inside the sandbox and
/// returns the in-sandbox path.
pub async fn install(
    runtime: &dyn SandboxRuntime,
    handle: &SandboxHandle,
    launcher_bytes: &[u8],
    filename: &str,
    target_dir: &str,
) -> Result<String, EngineError> {
    let transfer_error = |source: SandboxRuntimeError| EngineError::SandboxTransfer {
        sandbox_id: handle.sandbox_id().to_string(),
        source,
    };

    let archive = build_archive(filename, launcher_bytes)
        .map_err(|e| transfer_error(SandboxRuntimeError::IoError(e)))?;
    runtime
        .put_archive(handle.sandbox_id(), target_dir, archive)
        .await
        .map_err(transfer_error)?;

    let path = format!("{}/{}", target_dir.trim_end_matches('/'), filename);
    log::debug!(
        "Installed launcher {} ({} bytes) into sandbox {}",
        path,
        launcher_bytes.len(),
        handle.sandbox_id()
    );
    Ok(path)
}

/// Convenience over `install` for a rendered launcher.
pub async fn install_launcher(
    runtime: &dyn SandboxRuntime,
    handle: &SandboxHandle,
    launcher: &Launcher,
    target_dir: &str,
) -> Result<String, EngineError> {
    install(runtime, handle, &launcher.script, &launcher.filename, target_dir).await
}
