use async_trait::async_trait;
use fnbox_core::config::EngineConfig;
use fnbox_core::core_types::{ExecutionStatus, FunctionRecord, ResultEnvelope};
use fnbox_core::errors::{EngineError, FailureKind, SandboxRuntimeError};
use fnbox_core::pool::{FUNCTION_ID_LABEL, INSTANCE_LABEL};
use fnbox_core::registry::InMemoryRegistry;
use fnbox_core::runtime::{ExecOutput, SandboxInfo, SandboxRuntime, SandboxSpec};
use fnbox_core::wrapper::{INPUT_ENV_VAR, RESULT_END_MARKER, RESULT_START_MARKER};
use fnbox_core::{CleanupReport, ExecutionEngine};
use futures_util::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

const PYTHON_ECHO: &str = "def main(input):\n    return input\n";
const JS_ECHO: &str = "function main(input) { return input; }\n";

#[derive(Debug, Clone)]
struct ExecRequest {
    sandbox_id: String,
    command: Vec<String>,
    env: Vec<(String, String)>,
}

impl ExecRequest {
    fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

type Responder =
    Arc<dyn Fn(ExecRequest) -> BoxFuture<'static, Result<ExecOutput, SandboxRuntimeError>> + Send + Sync>;

struct MockSandbox {
    id: String,
    name: String,
    running: bool,
    labels: HashMap<String, String>,
}

impl MockSandbox {
    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            running: self.running,
            labels: self.labels.clone(),
        }
    }
}

#[derive(Default)]
struct MockState {
    next_id: usize,
    sandboxes: Vec<MockSandbox>,
    events: Vec<String>,
    execs: Vec<ExecRequest>,
    fail_create: bool,
    fail_put_archive: bool,
    /// Delay after a sandbox is registered and before `create` returns.
    create_delay: Option<Duration>,
}

#[derive(Clone)]
struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    responder: Responder,
    stats: Value,
}

impl MockRuntime {
    fn new(responder: Responder) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            responder,
            stats: json!({
                "memory_stats": { "usage": 64 * 1024 * 1024 },
                "cpu_stats": { "cpu_usage": { "total_usage": 300 }, "system_cpu_usage": 2000 },
                "precpu_stats": { "cpu_usage": { "total_usage": 100 }, "system_cpu_usage": 1000 }
            }),
        }
    }

    fn echo() -> Self {
        Self::new(echo_responder())
    }

    fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    /// Lifecycle events only: create, stop and remove.
    fn lifecycle(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("create:") || e.starts_with("stop:") || e.starts_with("remove:"))
            .collect()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn execs(&self) -> Vec<ExecRequest> {
        self.state.lock().unwrap().execs.clone()
    }

    fn live_sandboxes(&self) -> usize {
        self.state.lock().unwrap().sandboxes.len()
    }

    fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    fn set_fail_put_archive(&self, fail: bool) {
        self.state.lock().unwrap().fail_put_archive = fail;
    }

    fn set_create_delay(&self, delay: Duration) {
        self.state.lock().unwrap().create_delay = Some(delay);
    }

    /// A sandbox that exists before the engine starts, e.g. after a crash.
    fn seed(&self, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("stale-{}", name);
        state.sandboxes.push(MockSandbox {
            id: id.clone(),
            name: name.to_string(),
            running: true,
            labels: HashMap::new(),
        });
        id
    }

    fn mark_stopped(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(sandbox) = state.sandboxes.iter_mut().find(|s| s.id == id) {
            sandbox.running = false;
        }
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn ping(&self) -> Result<(), SandboxRuntimeError> {
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String, SandboxRuntimeError> {
        let (id, delay) = {
            let mut state = self.state.lock().unwrap();
            if state.fail_create {
                return Err(SandboxRuntimeError::Rejected("image not available".to_string()));
            }
            if state.sandboxes.iter().any(|s| s.name == spec.name) {
                return Err(SandboxRuntimeError::Rejected(format!(
                    "name {} is already in use",
                    spec.name
                )));
            }
            state.next_id += 1;
            let id = format!("sandbox-{}", state.next_id);
            state.sandboxes.push(MockSandbox {
                id: id.clone(),
                name: spec.name.clone(),
                running: true,
                labels: spec.labels.clone(),
            });
            state.events.push(format!("create:{}", spec.name));
            (id, state.create_delay)
        };
        // The sandbox already exists while a slow start is still pending.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn get(&self, name_or_id: &str) -> Result<Option<SandboxInfo>, SandboxRuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sandboxes
            .iter()
            .find(|s| s.id == name_or_id || s.name == name_or_id)
            .map(MockSandbox::info))
    }

    async fn list(&self, label: &str, value: &str) -> Result<Vec<SandboxInfo>, SandboxRuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sandboxes
            .iter()
            .filter(|s| s.labels.get(label).map(String::as_str) == Some(value))
            .map(MockSandbox::info)
            .collect())
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxRuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("stop:{}", id));
        if let Some(sandbox) = state.sandboxes.iter_mut().find(|s| s.id == id) {
            sandbox.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxRuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("remove:{}", id));
        state.sandboxes.retain(|s| s.id != id);
        Ok(())
    }

    async fn put_archive(
        &self,
        id: &str,
        target_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxRuntimeError> {
        let mut names = Vec::new();
        let mut reader = tar::Archive::new(archive.as_slice());
        for entry in reader.entries()? {
            let entry = entry?;
            names.push(entry.path()?.display().to_string());
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_put_archive {
            return Err(SandboxRuntimeError::Rejected("archive upload refused".to_string()));
        }
        if !state.sandboxes.iter().any(|s| s.id == id) {
            return Err(SandboxRuntimeError::NotFound(id.to_string()));
        }
        for name in names {
            state
                .events
                .push(format!("put_archive:{}:{}/{}", id, target_dir, name));
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        command: &[String],
        env: &[(String, String)],
    ) -> Result<ExecOutput, SandboxRuntimeError> {
        let request = ExecRequest {
            sandbox_id: id.to_string(),
            command: command.to_vec(),
            env: env.to_vec(),
        };
        {
            let mut state = self.state.lock().unwrap();
            state.events.push(format!("exec:{}", id));
            state.execs.push(request.clone());
        }
        (self.responder)(request).await
    }

    async fn kill_running(&self, id: &str) -> Result<(), SandboxRuntimeError> {
        self.state.lock().unwrap().events.push(format!("kill:{}", id));
        Ok(())
    }

    async fn stats(&self, _id: &str) -> Result<Value, SandboxRuntimeError> {
        Ok(self.stats.clone())
    }
}

fn respond<F, Fut>(handler: F) -> Responder
where
    F: Fn(ExecRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecOutput, SandboxRuntimeError>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(handler(request)))
}

fn result_block(payload: &str) -> String {
    format!("{}\n{}\n{}\n", RESULT_START_MARKER, payload, RESULT_END_MARKER)
}

fn exited(code: i64, output: impl Into<String>) -> Result<ExecOutput, SandboxRuntimeError> {
    Ok(ExecOutput {
        exit_code: Some(code),
        output: output.into(),
    })
}

/// Behaves like a launcher whose `main` returns its input.
fn echo_responder() -> Responder {
    respond(|request: ExecRequest| async move {
        let input = request.env_var(INPUT_ENV_VAR).unwrap_or("null").to_string();
        exited(
            0,
            format!("starting up\n{}", result_block(&format!("{{\"result\": {}}}", input))),
        )
    })
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timeout_grace_secs = 0;
    config
}

fn engine_with_config(
    runtime: &MockRuntime,
    registry: Arc<InMemoryRegistry>,
    config: EngineConfig,
) -> ExecutionEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    ExecutionEngine::new(Arc::new(runtime.clone()), registry, config).unwrap()
}

fn engine(runtime: &MockRuntime, registry: Arc<InMemoryRegistry>) -> ExecutionEngine {
    engine_with_config(runtime, registry, test_config())
}

#[tokio::test]
async fn test_echo_function_in_both_languages() {
    let runtime = MockRuntime::echo();
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());
    let input = json!({"a": 1, "nested": [true, null]});

    let python = FunctionRecord::new("py", "python", PYTHON_ECHO);
    let (envelope, metrics) = engine.execute("py", &python, &input).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(input.clone()));
    assert_eq!(metrics.status, ExecutionStatus::Success);
    assert_eq!(metrics.function_id, "py");
    assert_eq!(metrics.memory_usage, 64.0);
    assert_eq!(metrics.cpu_usage, 20.0);
    assert!(metrics.execution_time >= 0.0);

    let js = FunctionRecord::new("js", "javascript", JS_ECHO);
    let (envelope, _) = engine.execute("js", &js, &input).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(input));

    let events = runtime.events();
    assert!(events.contains(&"put_archive:sandbox-1:/tmp/function.py".to_string()));
    assert!(events.contains(&"put_archive:sandbox-2:/tmp/function.js".to_string()));

    let execs = runtime.execs();
    assert_eq!(execs[0].command[..4], ["timeout", "-s", "KILL", "30s"]);
    assert_eq!(execs[0].command.last().unwrap(), "/tmp/function.py");
    assert_eq!(execs[1].command[4], "node");
}

#[tokio::test]
async fn test_sandbox_is_reused_across_executions() {
    let runtime = MockRuntime::echo();
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    engine.execute("f", &record, &json!(1)).await.unwrap();
    let first = engine.sandbox_id("f").await.unwrap();
    engine.execute("f", &record, &json!(2)).await.unwrap();
    let second = engine.sandbox_id("f").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(runtime.count("create:"), 1);
    assert_eq!(runtime.count("put_archive:"), 2);
}

#[tokio::test]
async fn test_language_switch_replaces_sandbox() {
    let runtime = MockRuntime::echo();
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));

    let python = FunctionRecord::new("f", "python", PYTHON_ECHO);
    engine.execute("f", &python, &json!(1)).await.unwrap();
    let before = engine.sandbox_id("f").await.unwrap();

    let js = FunctionRecord::new("f", "javascript", JS_ECHO);
    let (envelope, _) = engine.execute("f", &js, &json!(1)).await.unwrap();
    let after = engine.sandbox_id("f").await.unwrap();

    assert_eq!(envelope, ResultEnvelope::Value(json!(1)));
    assert_ne!(before, after);
    assert_eq!(
        runtime.lifecycle(),
        vec![
            "create:function_f".to_string(),
            format!("stop:{}", before),
            format!("remove:{}", before),
            "create:function_f".to_string(),
        ]
    );
    assert_eq!(runtime.live_sandboxes(), 1);
}

#[tokio::test]
async fn test_dead_sandbox_is_recreated() {
    let runtime = MockRuntime::echo();
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    engine.execute("f", &record, &json!(1)).await.unwrap();
    let before = engine.sandbox_id("f").await.unwrap();
    runtime.mark_stopped(&before);

    engine.execute("f", &record, &json!(1)).await.unwrap();
    let after = engine.sandbox_id("f").await.unwrap();

    assert_ne!(before, after);
    assert!(runtime.events().contains(&format!("remove:{}", before)));
    assert_eq!(runtime.live_sandboxes(), 1);
}

#[tokio::test]
async fn test_leftover_sandbox_is_removed_before_create() {
    let runtime = MockRuntime::echo();
    let stale = runtime.seed("function_f");
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    let (envelope, _) = engine.execute("f", &record, &json!("ok")).await.unwrap();

    assert_eq!(envelope, ResultEnvelope::Value(json!("ok")));
    assert_eq!(
        runtime.lifecycle(),
        vec![format!("remove:{}", stale), "create:function_f".to_string()]
    );
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let runtime = MockRuntime::echo();
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    engine.execute("f", &record, &json!(1)).await.unwrap();
    engine.delete("f").await;
    engine.delete("f").await;
    engine.delete("never-executed").await;

    assert!(engine.sandbox_id("f").await.is_none());
    assert_eq!(runtime.count("remove:"), 1);
    assert_eq!(runtime.live_sandboxes(), 0);
    assert!(engine.function_ids().is_empty());
}

#[tokio::test]
async fn test_last_result_block_wins() {
    let runtime = MockRuntime::new(respond(|_request: ExecRequest| async move {
        exited(
            0,
            format!(
                "{}user output\n{}",
                result_block(r#"{"result": "spoofed"}"#),
                result_block(r#"{"result": "real"}"#)
            ),
        )
    }));
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    let (envelope, _) = engine.execute("f", &record, &json!(null)).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(json!("real")));
}

#[tokio::test]
async fn test_output_without_markers_is_returned_raw() {
    let runtime = MockRuntime::new(respond(|_request: ExecRequest| async move {
        exited(0, "just some text\n")
    }));
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    let (envelope, metrics) = engine.execute("f", &record, &json!(null)).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(json!("just some text\n")));
    assert!(metrics.is_success());
}

#[tokio::test]
async fn test_function_error_is_reported_as_failure() {
    let runtime = MockRuntime::new(respond(|_request: ExecRequest| async move {
        exited(0, result_block(r#"{"error": "boom"}"#))
    }));
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());
    let record = FunctionRecord::new("f", "python", "def main(input):\n    raise Exception('boom')\n");

    let (envelope, metrics) = engine.execute("f", &record, &json!({})).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::runtime_error("boom"));
    assert_eq!(metrics.status, ExecutionStatus::Failure);
    assert_eq!(metrics.error_kind, Some(FailureKind::Runtime));
    assert_eq!(metrics.error_message.as_deref(), Some("boom"));

    let recorded = registry.metrics_for("f").await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, ExecutionStatus::Failure);
}

#[tokio::test]
async fn test_timeout_kills_command_and_keeps_sandbox() {
    let runtime = MockRuntime::new(respond(|_request: ExecRequest| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        exited(0, result_block(r#"{"result": "too late"}"#))
    }));
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO).with_timeout(1);

    let (envelope, metrics) = engine.execute("f", &record, &json!(null)).await.unwrap();

    assert_eq!(envelope, ResultEnvelope::timeout(1));
    assert_eq!(
        envelope.error_message(),
        Some("Function execution timed out after 1 seconds")
    );
    assert_eq!(metrics.error_kind, Some(FailureKind::Timeout));
    assert!(metrics.execution_time >= 1.0);

    let sandbox_id = engine.sandbox_id("f").await.unwrap();
    assert!(runtime.events().contains(&format!("kill:{}", sandbox_id)));
    assert_eq!(registry.metrics_for("f").await.len(), 1);
}

#[tokio::test]
async fn test_killed_exit_code_after_deadline_is_a_timeout() {
    let runtime = MockRuntime::new(respond(|_request: ExecRequest| async move {
        tokio::time::sleep(Duration::from_millis(1100)).await;
        exited(137, "")
    }));
    let mut config = test_config();
    config.timeout_grace_secs = 5;
    let engine = engine_with_config(&runtime, Arc::new(InMemoryRegistry::new()), config);
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO).with_timeout(1);

    let (envelope, _) = engine.execute("f", &record, &json!(null)).await.unwrap();
    assert_eq!(envelope.failure_kind(), Some(FailureKind::Timeout));
    assert_eq!(runtime.count("kill:"), 0);
}

#[tokio::test]
async fn test_printed_block_before_a_kill_is_still_a_timeout() {
    // The function printed a block of its own, then hung until the in-sandbox kill.
    let runtime = MockRuntime::new(respond(|_request: ExecRequest| async move {
        tokio::time::sleep(Duration::from_millis(1100)).await;
        exited(137, result_block(r#"{"result": "spoofed"}"#))
    }));
    let mut config = test_config();
    config.timeout_grace_secs = 5;
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine_with_config(&runtime, registry.clone(), config);
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO).with_timeout(1);

    let (envelope, metrics) = engine.execute("f", &record, &json!(null)).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::timeout(1));
    assert_eq!(metrics.error_kind, Some(FailureKind::Timeout));
}

#[tokio::test]
async fn test_largest_timeout_does_not_overflow_the_deadline() {
    let runtime = MockRuntime::echo();
    let mut config = test_config();
    config.timeout_grace_secs = 5;
    let engine = engine_with_config(&runtime, Arc::new(InMemoryRegistry::new()), config);
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO).with_timeout(u64::MAX);

    let (envelope, _) = engine.execute("f", &record, &json!(7)).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(json!(7)));
    assert_eq!(runtime.execs()[0].command[3], format!("{}s", u64::MAX));
}

#[tokio::test]
async fn test_fast_kill_is_not_mistaken_for_timeout() {
    let runtime = MockRuntime::new(respond(|_request: ExecRequest| async move {
        exited(137, "Killed\n")
    }));
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO).with_timeout(10);

    let (envelope, _) = engine.execute("f", &record, &json!(null)).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(json!("Killed\n")));
}

#[tokio::test]
async fn test_transfer_failure_keeps_sandbox() {
    let runtime = MockRuntime::echo();
    runtime.set_fail_put_archive(true);
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    let err = engine.execute("f", &record, &json!(null)).await.unwrap_err();
    assert!(matches!(err, EngineError::SandboxTransfer { .. }));
    assert!(engine.sandbox_id("f").await.is_some());
    assert_eq!(runtime.count("exec:"), 0);

    let recorded = registry.metrics_for("f").await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].error_kind, Some(FailureKind::Transfer));

    runtime.set_fail_put_archive(false);
    engine.execute("f", &record, &json!(null)).await.unwrap();
    assert_eq!(runtime.count("create:"), 1);
}

#[tokio::test]
async fn test_creation_failure_caches_nothing() {
    let runtime = MockRuntime::echo();
    runtime.set_fail_create(true);
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    let err = engine.execute("f", &record, &json!(null)).await.unwrap_err();
    assert!(matches!(err, EngineError::SandboxCreation { .. }));
    assert!(engine.sandbox_id("f").await.is_none());
    assert_eq!(
        registry.metrics_for("f").await[0].error_kind,
        Some(FailureKind::Creation)
    );

    runtime.set_fail_create(false);
    let (envelope, _) = engine.execute("f", &record, &json!(5)).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(json!(5)));
}

#[tokio::test]
async fn test_unsupported_language_is_rejected_without_a_sandbox() {
    let runtime = MockRuntime::echo();
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());
    let record = FunctionRecord::new("f", "cobol", "DISPLAY 'HI'.");

    let err = engine.execute("f", &record, &json!(null)).await.unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedLanguage(ref tag) if tag == "cobol"));
    assert!(runtime.events().is_empty());
    assert_eq!(
        registry.metrics_for("f").await[0].error_kind,
        Some(FailureKind::Rejected)
    );
}

#[tokio::test]
async fn test_environment_is_passed_and_input_reserved() {
    let runtime = MockRuntime::echo();
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO)
        .with_env("GREETING", "hi")
        .with_env(INPUT_ENV_VAR, "spoofed");

    let (envelope, _) = engine.execute("f", &record, &json!({"x": 1})).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(json!({"x": 1})));

    let request = &runtime.execs()[0];
    assert_eq!(request.env_var("GREETING"), Some("hi"));
    assert_eq!(request.env_var(INPUT_ENV_VAR), Some("{\"x\":1}"));
    assert_eq!(
        request.env.iter().filter(|(k, _)| k == INPUT_ENV_VAR).count(),
        1
    );
}

#[tokio::test]
async fn test_execute_registered_looks_up_the_function() {
    let runtime = MockRuntime::echo();
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());

    let err = engine.execute_registered("f", &json!(1)).await.unwrap_err();
    assert!(matches!(err, EngineError::FunctionNotFound(_)));
    assert!(registry.metrics_for("f").await.is_empty());

    registry
        .register(FunctionRecord::new("f", "python", PYTHON_ECHO))
        .await;
    let (envelope, _) = engine.execute_registered("f", &json!(1)).await.unwrap();
    assert_eq!(envelope, ResultEnvelope::Value(json!(1)));
    assert_eq!(registry.metrics_for("f").await.len(), 1);
}

#[tokio::test]
async fn test_distinct_functions_run_concurrently() {
    // Both invocations must be in flight at once to get past the barrier.
    let barrier = Arc::new(Barrier::new(2));
    let runtime = MockRuntime::new(respond(move |request: ExecRequest| {
        let barrier = barrier.clone();
        async move {
            barrier.wait().await;
            let input = request.env_var(INPUT_ENV_VAR).unwrap_or("null").to_string();
            exited(0, result_block(&format!("{{\"result\": {}}}", input)))
        }
    }));
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let a = FunctionRecord::new("a", "python", PYTHON_ECHO);
    let b = FunctionRecord::new("b", "javascript", JS_ECHO);

    let input_a = json!("a");
    let input_b = json!("b");

    let both = async {
        tokio::join!(
            engine.execute("a", &a, &input_a),
            engine.execute("b", &b, &input_b)
        )
    };
    let (ra, rb) = tokio::time::timeout(Duration::from_secs(5), both)
        .await
        .expect("executions of different functions blocked each other");

    assert_eq!(ra.unwrap().0, ResultEnvelope::Value(json!("a")));
    assert_eq!(rb.unwrap().0, ResultEnvelope::Value(json!("b")));
    assert_ne!(engine.sandbox_id("a").await, engine.sandbox_id("b").await);
}

#[tokio::test]
async fn test_same_function_executions_are_serialized() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runtime = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        MockRuntime::new(respond(move |request: ExecRequest| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                let input = request.env_var(INPUT_ENV_VAR).unwrap_or("null").to_string();
                exited(0, result_block(&format!("{{\"result\": {}}}", input)))
            }
        }))
    };
    let registry = Arc::new(InMemoryRegistry::new());
    let engine = engine(&runtime, registry.clone());
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    let inputs: Vec<Value> = (0..4).map(|i| json!(i)).collect();
    let results = join_all(inputs.iter().map(|input| engine.execute("f", &record, input))).await;

    for (result, input) in results.into_iter().zip(&inputs) {
        assert_eq!(result.unwrap().0, ResultEnvelope::Value(input.clone()));
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.count("create:"), 1);
    assert_eq!(registry.metrics_for("f").await.len(), 4);
}

#[tokio::test]
async fn test_shutdown_removes_every_sandbox() {
    let runtime = MockRuntime::echo();
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    engine
        .execute("a", &FunctionRecord::new("a", "python", PYTHON_ECHO), &json!(1))
        .await
        .unwrap();
    engine
        .execute("b", &FunctionRecord::new("b", "javascript", JS_ECHO), &json!(1))
        .await
        .unwrap();

    let mut report = engine.shutdown().await;
    report.removed.sort();

    assert_eq!(report.removed, vec!["a".to_string(), "b".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(runtime.live_sandboxes(), 0);
    assert!(engine.function_ids().is_empty());

    let again = engine.shutdown().await;
    assert!(again.removed.is_empty());
}

#[tokio::test]
async fn test_shutdown_removes_sandbox_of_abandoned_execution() {
    let runtime = MockRuntime::echo();
    runtime.set_create_delay(Duration::from_millis(200));
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let record = FunctionRecord::new("f", "python", PYTHON_ECHO);

    // The caller gives up while the sandbox is being started.
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), engine.execute("f", &record, &json!(1))).await;
    assert!(abandoned.is_err());
    assert_eq!(runtime.live_sandboxes(), 1);
    assert!(engine.sandbox_id("f").await.is_none());

    let report = engine.shutdown().await;
    assert!(report.removed.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(report.orphans, vec!["f".to_string()]);
    assert_eq!(runtime.live_sandboxes(), 0);
}

#[tokio::test]
async fn test_shutdown_leaves_other_engines_sandboxes_alone() {
    let runtime = MockRuntime::echo();
    let first = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let second = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    let stale = runtime.seed("unrelated");

    second
        .execute("g", &FunctionRecord::new("g", "python", PYTHON_ECHO), &json!(1))
        .await
        .unwrap();
    let report = first.shutdown().await;

    assert_eq!(report, CleanupReport::default());
    assert_eq!(runtime.live_sandboxes(), 2);
    assert!(runtime.lifecycle().iter().all(|e| !e.ends_with(&stale)));

    let state = runtime.state.lock().unwrap();
    let labels = &state.sandboxes.iter().find(|s| s.id != stale).unwrap().labels;
    assert_eq!(labels.get(FUNCTION_ID_LABEL).map(String::as_str), Some("g"));
    assert!(labels.contains_key(INSTANCE_LABEL));
}

#[tokio::test]
async fn test_sandbox_ids_are_exposed_per_function() {
    let runtime = MockRuntime::echo();
    let engine = engine(&runtime, Arc::new(InMemoryRegistry::new()));
    assert!(engine.sandbox_id("f").await.is_none());

    engine
        .execute("f", &FunctionRecord::new("f", "python", PYTHON_ECHO), &json!(1))
        .await
        .unwrap();
    let id = engine.sandbox_id("f").await.unwrap();
    assert_eq!(runtime.execs()[0].sandbox_id, id);
}
