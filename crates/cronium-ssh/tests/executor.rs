//! End-to-end executions against the local transport.
//!
//! Scripts really run through `sh`/`bash` (and `python3`/`node` when
//! installed) inside a scratch directory, so these cover the generated
//! runtimes, the command line and the result read-back together.

mod common;

use common::{has_command, target, LocalConnector, RecordingStore, StoreCall, TempRoot};
use cronium_ssh::{
    ConnectionPool, ExecutionRequest, ExecutionTarget, ExecutorConfig, MemoryVariableStore,
    PoolConfig, RemoteSession, ScriptExecutor, ScriptLanguage, VariableStore,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    root: TempRoot,
    connector: Arc<LocalConnector>,
    pool: Arc<ConnectionPool>,
}

impl Harness {
    fn new() -> Self {
        Self::with_pool(PoolConfig::default())
    }

    fn with_pool(config: PoolConfig) -> Self {
        let connector = Arc::new(LocalConnector::default());
        let pool = Arc::new(ConnectionPool::new(config, connector.clone()));
        Self {
            root: TempRoot::new(),
            connector,
            pool,
        }
    }

    fn config(&self) -> ExecutorConfig {
        ExecutorConfig {
            workdir_root: self.root.as_str().to_string(),
            default_shell: "/bin/bash".into(),
            ..ExecutorConfig::default()
        }
    }

    fn executor(&self) -> ScriptExecutor {
        ScriptExecutor::new(Arc::clone(&self.pool), self.config())
    }

    fn executor_with_store(&self, store: Arc<dyn VariableStore>) -> ScriptExecutor {
        self.executor().with_variable_store(store)
    }
}

fn pooled(language: ScriptLanguage, script: &str) -> ExecutionRequest {
    ExecutionRequest::new(language, script).with_target(ExecutionTarget::Pooled(target("localhost")))
}

#[tokio::test]
async fn test_python_doubles_input() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let harness = Harness::new();
    let request = pooled(
        ScriptLanguage::Python,
        r#"output({"doubled": input()["n"] * 2})"#,
    )
    .with_input(json!({"n": 5}));

    let result = harness.executor().run(request).await;

    assert_eq!(result.script_output, Some(json!({"doubled": 10})), "stderr: {}", result.stderr);
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.is_timeout());
}

#[tokio::test]
async fn test_bash_output_and_condition_round_trip() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let harness = Harness::new();
    let request = pooled(
        ScriptLanguage::Bash,
        "echo running\ncronium.output '{\"x\":1}'\ncronium.setCondition true >/dev/null",
    );

    let result = harness.executor().run(request).await;

    assert!(result.stdout.contains("running"));
    assert_eq!(result.script_output, Some(json!({"x": 1})), "stderr: {}", result.stderr);
    assert_eq!(result.condition, Some(true));
}

#[tokio::test]
async fn test_missing_result_files_are_absent() {
    let harness = Harness::new();
    let result = harness.executor().run(pooled(ScriptLanguage::Bash, "echo quiet")).await;

    assert!(result.stdout.trim_end().ends_with("quiet"));
    assert_eq!(result.script_output, None);
    assert_eq!(result.condition, None);
    let json = serde_json::to_value(&result).unwrap();
    assert!(json.get("scriptOutput").is_none());
}

#[tokio::test]
async fn test_invalid_output_file_is_absent() {
    let harness = Harness::new();
    let result = harness
        .executor()
        .run(pooled(ScriptLanguage::Bash, "echo '{not json' > output.json"))
        .await;
    assert_eq!(result.script_output, None);
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_not_failed() {
    let harness = Harness::new();
    let result = harness
        .executor()
        .run(pooled(ScriptLanguage::Bash, "echo partial; exit 3"))
        .await;
    assert_eq!(result.exit_code, Some(3));
    assert!(result.stdout.contains("partial"));
    assert!(!result.is_timeout());
}

#[tokio::test]
async fn test_env_is_exported_and_invalid_names_skipped() {
    let harness = Harness::new();
    let request = pooled(ScriptLanguage::Bash, "echo \"$GREETING\"")
        .with_env("GREETING", "it's alive")
        .with_env("not-valid", "x");

    let result = harness.executor().run(request).await;
    assert!(result.stdout.trim_end().ends_with("it's alive"));
}

/// Snapshot `{a:"1"}` and a post-run file `{b:"2"}` give one set and one delete.
#[tokio::test]
async fn test_variable_diff_written_to_store() {
    let harness = Harness::new();
    let store = RecordingStore::with(&[("a", "1")]);
    let executor = harness.executor_with_store(store.clone());
    let request = pooled(ScriptLanguage::Bash, r#"echo '{"b":"2"}' > variables.json"#)
        .with_user_id("user-1");

    let result = executor.run(request).await;

    assert_eq!(result.exit_code, Some(0), "stderr: {}", result.stderr);
    let calls = store.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&StoreCall::Set("b".into(), "2".into())));
    assert!(calls.contains(&StoreCall::Delete("a".into())));
}

#[tokio::test]
async fn test_python_set_variable_merges_into_store() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let harness = Harness::new();
    let store = Arc::new(MemoryVariableStore::new());
    store.set("user-2", "a", "1").await.unwrap();
    let executor = harness.executor_with_store(store.clone());

    let request = pooled(
        ScriptLanguage::Python,
        "setVariable('b', getVariable('a') + '2')\nsetVariable('n', 7)",
    )
    .with_user_id("user-2");
    let result = executor.run(request).await;

    assert_eq!(result.exit_code, Some(0), "stderr: {}", result.stderr);
    let vars = store.snapshot("user-2").await;
    assert_eq!(vars.get("a").map(String::as_str), Some("1"));
    assert_eq!(vars.get("b").map(String::as_str), Some("12"));
    assert_eq!(vars.get("n").map(String::as_str), Some("7"));
    assert!(!vars.contains_key("__updated__"));
}

#[tokio::test]
async fn test_explicit_snapshot_skips_store_read() {
    let harness = Harness::new();
    let executor = harness.executor_with_store(RecordingStore::failing());
    let request = pooled(ScriptLanguage::Bash, "cat variables.json")
        .with_user_id("user-3")
        .with_variables([("k".to_string(), "v".to_string())].into_iter().collect());

    let result = executor.run(request).await;
    assert!(result.stdout.contains("\"k\": \"v\""), "stdout: {}", result.stdout);
}

#[tokio::test]
async fn test_store_failure_becomes_error_result() {
    let harness = Harness::new();
    let executor = harness.executor_with_store(RecordingStore::failing());
    let request = pooled(ScriptLanguage::Bash, "echo never").with_user_id("user-4");

    let result = executor.run(request).await;
    assert!(result.stdout.is_empty());
    assert!(result.stderr.contains("variable store error"));
    assert_eq!(result.is_timeout, Some(false));
}

/// Concurrent runs on one pooled connection use separate working directories.
#[tokio::test]
async fn test_concurrent_runs_use_distinct_workdirs() {
    let harness = Harness::new();
    let executor = Arc::new(harness.executor());

    let runs = (0..6).map(|i| {
        let executor = Arc::clone(&executor);
        let request = pooled(ScriptLanguage::Bash, "pwd; sleep 0.2; cat input.json")
            .with_input(json!({ "run": i }));
        tokio::spawn(async move { executor.run(request).await })
    });
    let results: Vec<_> = futures::future::join_all(runs)
        .await
        .into_iter()
        .map(|r| r.expect("task"))
        .collect();

    let mut dirs: Vec<&str> = results
        .iter()
        .map(|r| {
            r.stdout
                .lines()
                .find(|line| line.starts_with(harness.root.as_str()))
                .unwrap_or_default()
        })
        .collect();
    for (i, result) in results.iter().enumerate() {
        assert!(result.stdout.contains(&format!("\"run\": {i}")), "run {i}: {}", result.stdout);
    }
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), 6);
    assert!(dirs.iter().all(|d| d.starts_with(harness.root.as_str())));

    assert_eq!(harness.connector.dials(), 1);
    assert!(harness.root.entries().is_empty(), "left behind: {:?}", harness.root.entries());
}

#[tokio::test]
async fn test_timeout_reports_and_cleans_up() {
    let harness = Harness::new();
    let request = pooled(ScriptLanguage::Bash, "echo started; sleep 5").with_timeout(Duration::from_millis(300));

    let result = harness.executor().run(request).await;

    assert!(result.is_timeout());
    assert_eq!(result.stderr, "Execution timed out after 300ms");
    assert!(result.stdout.is_empty());
    assert!(harness.root.entries().is_empty());
}

/// The reaper leaves a pooled session alone while a script runs on it.
#[tokio::test]
async fn test_long_run_outlives_idle_timeout() {
    if !has_command("python3") {
        eprintln!("Skipping test: python3 not installed");
        return;
    }
    let harness = Harness::with_pool(PoolConfig {
        idle_timeout: Duration::from_millis(500),
        reap_interval: Duration::from_millis(100),
        ..PoolConfig::default()
    });
    harness.pool.start();

    let request = pooled(ScriptLanguage::Bash, "sleep 2\ncronium.output '{\"ok\":1}'");
    let result = harness.executor().run(request).await;

    assert_eq!(result.script_output, Some(json!({"ok": 1})), "stderr: {}", result.stderr);
    assert!(!harness.connector.session(0).closed.load(Ordering::SeqCst));
    assert_eq!(harness.pool.stats().evictions(), 0);
    assert!(harness.pool.contains("deploy@localhost:22").await);

    harness.pool.shutdown().await;
}

#[tokio::test]
async fn test_missing_target_is_error_result() {
    let harness = Harness::new();
    let result = harness
        .executor()
        .run(ExecutionRequest::new(ScriptLanguage::Bash, "echo hi"))
        .await;
    assert_eq!(result.stderr, "no SSH session available");
    assert_eq!(result.is_timeout, Some(false));
}

#[tokio::test]
async fn test_bad_http_descriptor_is_error_result() {
    let harness = Harness::new();
    let result = harness.executor().run(pooled(ScriptLanguage::Http, "{\"method\":\"GET\"}")).await;
    assert!(result.stderr.starts_with("invalid HTTP request"));
    assert!(harness.root.entries().is_empty());
}

#[tokio::test]
async fn test_direct_session_is_left_open() {
    let harness = Harness::new();
    let session = Arc::new(common::LocalSession::default());
    let request = ExecutionRequest::new(ScriptLanguage::Bash, "echo direct").with_target(ExecutionTarget::Session {
        key: "local".into(),
        session: session.clone(),
    });

    let result = harness.executor().run(request).await;
    assert!(result.stdout.trim_end().ends_with("direct"));
    assert!(!session.is_closed());
    assert_eq!(harness.pool.size().await, 0);
}

#[tokio::test]
async fn test_unpooled_session_is_closed_after_run() {
    let harness = Harness::new();
    let request = ExecutionRequest::new(ScriptLanguage::Bash, "echo once")
        .with_target(ExecutionTarget::Unpooled(target("localhost")));

    let result = harness.executor().run(request).await;
    assert!(result.stdout.trim_end().ends_with("once"));
    assert_eq!(harness.pool.size().await, 0);
    assert!(harness.connector.session(0).closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_node_runtime_round_trip() {
    if !has_command("node") {
        eprintln!("Skipping test: node not installed");
        return;
    }
    let harness = Harness::new();
    let request = pooled(
        ScriptLanguage::Node,
        "setCondition(input().ok);\noutput({ greeting: `hi ${event().name}` });",
    )
    .with_input(json!({"ok": true}))
    .with_event(json!({"name": "cron"}));

    let result = harness.executor().run(request).await;
    assert_eq!(result.script_output, Some(json!({"greeting": "hi cron"})), "stderr: {}", result.stderr);
    assert_eq!(result.condition, Some(true));
}
