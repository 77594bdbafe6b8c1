//! Sandbox pool: at most one live sandbox per function identity.
//!
//! Each function id owns a slot guarded by an async mutex. Holding the slot's
//! guard (a `SandboxLease`) is the exclusive section for that function:
//! acquire, install, invoke and cleanup all run under it, so a teardown can
//! never race an execution of the same function. The outer map lock is only
//! taken to find or insert a slot and is never held across a runtime call,
//! so different functions never contend.
//!
//! Per-slot state machine:
//!
//! ```text
//! absent --create--> ready --reuse--> ready
//!                    ready --language mismatch / dead sandbox--> removed --> absent
//! absent --create fails--> absent
//! ```
//!
//! Every sandbox also carries the pool's instance label. A caller that drops
//! an execution mid-create leaves a running sandbox the slot never learned
//! about; `cleanup_all` finds those through the label and removes them too.

use crate::config::EngineConfig;
use crate::errors::{ConfigError, EngineError, SandboxRuntimeError};
use crate::language::Language;
use crate::runtime::{ResourceLimits, SandboxRuntime, SandboxSpec};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

pub const FUNCTION_ID_LABEL: &str = "fnbox.function_id";
pub const LANGUAGE_LABEL: &str = "fnbox.language";
/// Identifies the pool that created a sandbox.
pub const INSTANCE_LABEL: &str = "fnbox.instance";

/// A provisioned sandbox. Only the pool creates these.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxHandle {
    function_id: String,
    sandbox_id: String,
    language: Language,
    created_at: DateTime<Utc>,
}

impl SandboxHandle {
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Image and limit settings the pool provisions with.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub container_prefix: String,
    pub limits: ResourceLimits,
    /// Image per language; a language missing here cannot be provisioned.
    pub images: HashMap<Language, String>,
    pub network_disabled: bool,
}

impl PoolSettings {
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            container_prefix: config.container_prefix.clone(),
            limits: config.resource_limits()?,
            images: Language::ALL
                .into_iter()
                .map(|language| (language, config.image_for(language)))
                .collect(),
            network_disabled: config.network_disabled,
        })
    }
}

type Slot = Arc<Mutex<Option<SandboxHandle>>>;

/// Summary of a `cleanup_all` sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    /// Function ids whose sandbox could not be stopped or removed.
    pub failed: Vec<String>,
    /// Function ids of sandboxes that no slot was tracking, found by label.
    pub orphans: Vec<String>,
}

pub struct SandboxPool {
    runtime: Arc<dyn SandboxRuntime>,
    settings: PoolSettings,
    instance_id: String,
    slots: StdMutex<HashMap<String, Slot>>,
}

/// Exclusive access to one function's slot. Dropping it ends the section.
pub struct SandboxLease<'a> {
    pool: &'a SandboxPool,
    function_id: String,
    slot: OwnedMutexGuard<Option<SandboxHandle>>,
}

impl SandboxPool {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, settings: PoolSettings) -> Self {
        Self {
            runtime,
            settings,
            instance_id: Uuid::new_v4().to_string(),
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Value of `INSTANCE_LABEL` on every sandbox this pool creates.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn slot(&self, function_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(function_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Waits for the function's exclusive section.
    pub(crate) async fn lease(&self, function_id: &str) -> SandboxLease<'_> {
        let slot = self.slot(function_id).lock_owned().await;
        SandboxLease {
            pool: self,
            function_id: function_id.to_string(),
            slot,
        }
    }

    /// Tears down the function's sandbox, if any. Never fails; problems are logged.
    pub async fn cleanup(&self, function_id: &str) {
        self.lease(function_id).await.cleanup().await;
    }

    /// Tears down every pooled sandbox, then any sandbox carrying this pool's
    /// instance label that no slot tracked. One failing sandbox does not stop
    /// the rest.
    pub async fn cleanup_all(&self) -> CleanupReport {
        let function_ids = self.function_ids();
        let outcomes = join_all(function_ids.into_iter().map(|function_id| async move {
            let outcome = self.lease(&function_id).await.release().await;
            (function_id, outcome)
        }))
        .await;

        let mut report = CleanupReport::default();
        for (function_id, outcome) in outcomes {
            match outcome {
                Some(true) => report.removed.push(function_id),
                Some(false) => report.failed.push(function_id),
                None => {}
            }
        }
        self.sweep_orphans(&mut report).await;
        report
    }

    async fn sweep_orphans(&self, report: &mut CleanupReport) {
        let orphans = match self.runtime.list(INSTANCE_LABEL, &self.instance_id).await {
            Ok(orphans) => orphans,
            Err(e) => {
                log::warn!("Could not list sandboxes of pool {}: {}", self.instance_id, e);
                return;
            }
        };

        for orphan in orphans {
            let function_id = orphan
                .labels
                .get(FUNCTION_ID_LABEL)
                .cloned()
                .unwrap_or_else(|| orphan.name.clone());
            log::warn!(
                "Removing untracked sandbox {} ({}) for function {}",
                orphan.name,
                orphan.id,
                function_id
            );
            if remove_sandbox(self.runtime.as_ref(), &orphan.id, &function_id).await {
                report.orphans.push(function_id);
            } else {
                report.failed.push(function_id);
            }
        }
    }

    /// Function ids that currently have a slot.
    pub fn function_ids(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.keys().cloned().collect()
    }

    /// The pooled sandbox id for a function, waiting for its exclusive section.
    pub async fn sandbox_id(&self, function_id: &str) -> Option<String> {
        let exists = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.contains_key(function_id)
        };
        if !exists {
            return None;
        }
        self.lease(function_id)
            .await
            .handle()
            .map(|h| h.sandbox_id.clone())
    }

    pub fn sandbox_name(&self, function_id: &str) -> String {
        sandbox_name(&self.settings.container_prefix, function_id)
    }

    async fn create(
        &self,
        function_id: &str,
        language: Language,
    ) -> Result<SandboxHandle, SandboxRuntimeError> {
        let name = self.sandbox_name(function_id);

        // A sandbox left behind by a crashed run would block the name.
        match self.runtime.get(&name).await {
            Ok(Some(existing)) => {
                log::warn!(
                    "Removing leftover sandbox {} ({}) before recreating it",
                    name,
                    existing.id
                );
                self.runtime.remove(&existing.id).await?;
            }
            Ok(None) => {}
            Err(e) => log::debug!("Could not look up sandbox {}: {}", name, e),
        }

        let image = self
            .settings
            .images
            .get(&language)
            .cloned()
            .ok_or_else(|| SandboxRuntimeError::Rejected(format!("no image configured for {}", language)))?;
        let spec = SandboxSpec {
            name: name.clone(),
            image,
            limits: self.settings.limits,
            keepalive_command: language.keepalive_command(),
            labels: HashMap::from([
                (FUNCTION_ID_LABEL.to_string(), function_id.to_string()),
                (LANGUAGE_LABEL.to_string(), language.to_string()),
                (INSTANCE_LABEL.to_string(), self.instance_id.clone()),
            ]),
            network_disabled: self.settings.network_disabled,
        };

        let sandbox_id = self.runtime.create(&spec).await?;
        log::info!(
            "Created {} sandbox {} ({}) for function {}",
            language,
            name,
            sandbox_id,
            function_id
        );
        Ok(SandboxHandle {
            function_id: function_id.to_string(),
            sandbox_id,
            language,
            created_at: Utc::now(),
        })
    }

    // Drops the slot from the map when nobody else holds or waits on it.
    fn evict_if_idle(&self, function_id: &str, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held by the caller's guard.
        if Arc::strong_count(slot) <= 2 {
            if let Some(current) = slots.get(function_id) {
                if Arc::ptr_eq(current, slot) {
                    slots.remove(function_id);
                }
            }
        }
    }
}

impl SandboxLease<'_> {
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub(crate) fn handle(&self) -> Option<&SandboxHandle> {
        self.slot.as_ref()
    }

    /// Returns a ready sandbox for `language`, reusing the pooled one when it
    /// matches and is still running.
    pub(crate) async fn acquire(&mut self, language: Language) -> Result<SandboxHandle, EngineError> {
        if let Some(handle) = self.slot.as_ref() {
            if handle.language != language {
                log::info!(
                    "Function {} switched from {} to {}; replacing sandbox {}",
                    self.function_id,
                    handle.language,
                    language,
                    handle.sandbox_id
                );
                self.teardown().await;
            } else if self.is_alive(handle).await {
                log::debug!(
                    "Reusing sandbox {} for function {}",
                    handle.sandbox_id,
                    self.function_id
                );
                return Ok(handle.clone());
            } else {
                log::warn!(
                    "Sandbox {} for function {} is no longer running; recreating",
                    handle.sandbox_id,
                    self.function_id
                );
                self.teardown().await;
            }
        }

        let handle = self
            .pool
            .create(&self.function_id, language)
            .await
            .map_err(|source| EngineError::SandboxCreation {
                function_id: self.function_id.clone(),
                source,
            })?;
        *self.slot = Some(handle.clone());
        Ok(handle)
    }

    async fn is_alive(&self, handle: &SandboxHandle) -> bool {
        match self.pool.runtime.get(&handle.sandbox_id).await {
            Ok(Some(info)) => info.running,
            Ok(None) => false,
            Err(e) => {
                log::warn!("Could not inspect sandbox {}: {}", handle.sandbox_id, e);
                false
            }
        }
    }

    /// Stops and removes the sandbox, then evicts the entry. Idempotent.
    pub async fn cleanup(self) {
        self.release().await;
    }

    async fn release(mut self) -> Option<bool> {
        let outcome = self.teardown().await;
        let slot = OwnedMutexGuard::mutex(&self.slot).clone();
        let SandboxLease {
            pool,
            function_id,
            slot: guard,
        } = self;
        drop(guard);
        pool.evict_if_idle(&function_id, &slot);
        outcome
    }

    /// `None` when there was nothing to remove, otherwise whether stop and
    /// remove both succeeded. The entry is cleared either way.
    async fn teardown(&mut self) -> Option<bool> {
        let handle = self.slot.take()?;
        let runtime = self.pool.runtime.as_ref();
        Some(remove_sandbox(runtime, &handle.sandbox_id, &handle.function_id).await)
    }
}

/// Stops then removes a sandbox; true when both succeeded.
async fn remove_sandbox(runtime: &dyn SandboxRuntime, sandbox_id: &str, function_id: &str) -> bool {
    let mut clean = true;

    if let Err(e) = runtime.stop(sandbox_id).await {
        log::warn!(
            "Failed to stop sandbox {} for function {}: {}",
            sandbox_id,
            function_id,
            e
        );
        clean = false;
    }
    if let Err(e) = runtime.remove(sandbox_id).await {
        log::warn!(
            "Failed to remove sandbox {} for function {}: {}",
            sandbox_id,
            function_id,
            e
        );
        clean = false;
    }

    if clean {
        log::info!("Removed sandbox {} for function {}", sandbox_id, function_id);
    }
    clean
}

/// Deterministic sandbox name for a function id.
///
/// Characters Docker does not accept in names become `_`; when that happens a
/// short digest of the raw id is appended so distinct ids stay distinct.
pub fn sandbox_name(prefix: &str, function_id: &str) -> String {
    let sanitized: String = function_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized == function_id && !function_id.is_empty() {
        return format!("{}{}", prefix, sanitized);
    }

    let digest = Sha256::digest(function_id.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}{}_{}", prefix, sanitized, suffix)
}
