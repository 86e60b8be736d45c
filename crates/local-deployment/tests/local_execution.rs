use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use executors::{
    executors::{BaseCodingAgent, gemini::session::project_hash},
    profile::{ExecutorProfileId, ProfileRegistry},
    storage::StorageRoots,
};
use futures::StreamExt;
use local_deployment::LocalExecutionService;
use serde_json::{Value, json};
use services::services::{
    active_executions::ActiveExecutions,
    config::TimingConfig,
    execution::{ExecutionContext, ExecutionError, ExecutionService, LaunchKind, LaunchRequest},
    log_source::ids,
};
use tempfile::TempDir;
use utils::log_msg::LogMsg;

struct Fixture {
    dir: TempDir,
    service: LocalExecutionService,
}

impl Fixture {
    fn new(profiles: Vec<Value>) -> Self {
        Self::build(3_000, |_| profiles)
    }

    /// `profiles` receives the fixture root, which holds `ws/` and the agents' `home/`.
    fn build(timeout_ms: u64, profiles: impl FnOnce(&Path) -> Vec<Value>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ws")).unwrap();
        let profiles = profiles(dir.path());
        let registry =
            ProfileRegistry::from_json(&json!({ "profiles": profiles }).to_string()).unwrap();
        let timing = TimingConfig {
            session_resolution_timeout_ms: timeout_ms,
            resolution_poll_interval_ms: 50,
            ..TimingConfig::default()
        };
        let service = LocalExecutionService::new(
            Arc::new(registry),
            Arc::new(ActiveExecutions::new()),
            StorageRoots::under(&dir.path().join("home")),
            timing,
        )
        .with_signal_grace(Duration::from_millis(100));
        Self { dir, service }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn workspace(&self) -> PathBuf {
        self.path("ws")
    }

    fn context(&self, label: &str, executor: BaseCodingAgent) -> ExecutionContext {
        ExecutionContext::new(ExecutorProfileId::new(label), executor, self.workspace())
    }
}

fn shell_profile(label: &str, executor: &str, script: &str, rest: &[&str], builder: bool) -> Value {
    let mut params = vec!["-c".to_string(), script.to_string()];
    params.extend(rest.iter().map(|s| s.to_string()));
    let mut profile = json!({
        "label": label,
        "executor": executor,
        "command": {"base": "/bin/sh", "params": params},
    });
    if builder {
        profile["builder"] = json!({ executor: {} });
    }
    profile
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within 5s");
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

#[tokio::test]
async fn new_codex_chat_sends_prompt_on_stdin_and_resolves_thread_id() {
    let scratch = tempfile::tempdir().unwrap();
    let out = scratch.path().join("codex").to_string_lossy().into_owned();
    let script = r#"cat > "$0.stdin"; printf '%s ' "$@" > "$0.args"; printf '{"type":"thread.started","thread_id":"t-42"}\n'; sleep 0.5"#;
    let fx = Fixture::new(vec![shell_profile(
        "fake-codex",
        "CODEX",
        script,
        &[&out, "exec", "--json", "--skip-git-repo-check"],
        true,
    )]);

    let request = LaunchRequest::new_chat(fx.context("fake-codex", BaseCodingAgent::Codex), "hello");
    let result = fx.service.spawn_new(request).await.unwrap();

    assert_eq!(result.kind, LaunchKind::New);
    assert_eq!(
        result.session_id,
        ids::compose_session_id(
            BaseCodingAgent::Codex,
            &fx.workspace().to_string_lossy(),
            "t-42"
        )
    );
    assert_eq!(
        result.project_id,
        ids::compose_project_id(BaseCodingAgent::Codex, &fx.workspace().to_string_lossy())
    );

    wait_until(|| !fx.service.is_running(&result.session_id)).await;
    wait_until(|| read(Path::new(&format!("{out}.args"))).contains("skip")).await;
    assert_eq!(read(Path::new(&format!("{out}.stdin"))), "hello");
    assert_eq!(
        read(Path::new(&format!("{out}.args"))).trim(),
        "exec --json --skip-git-repo-check"
    );
    assert!(fx.service.active().is_empty());
}

#[tokio::test]
async fn opencode_follow_up_links_session_by_flag() {
    let scratch = tempfile::tempdir().unwrap();
    let out = scratch.path().join("args").to_string_lossy().into_owned();
    let fx = Fixture::new(vec![shell_profile(
        "fake-opencode",
        "OPENCODE",
        r#"printf '%s\n' "$@" > "$0""#,
        &[&out, "run"],
        true,
    )]);

    let request = LaunchRequest::follow_up(
        fx.context("fake-opencode", BaseCodingAgent::Opencode),
        "OPENCODE:cGF0aA==:abc123",
        "keep going",
    );
    let result = fx.service.follow_up(request).await.unwrap();
    assert_eq!(result.kind, LaunchKind::FollowUp);
    assert_eq!(result.session_id, "OPENCODE:cGF0aA==:abc123");

    wait_until(|| read(Path::new(&out)).contains("abc123")).await;
    let args: Vec<String> = read(Path::new(&out)).lines().map(str::to_string).collect();
    assert_eq!(args, ["run", "keep going", "--session", "abc123"]);
    wait_until(|| !fx.service.is_running(&result.session_id)).await;
}

#[tokio::test]
async fn follow_up_to_a_running_session_is_refused() {
    let fx = Fixture::new(vec![shell_profile("fake-opencode", "OPENCODE", "true", &[], true)]);
    fx.service.active().register("OPENCODE:cGF0aA==:abc123");

    let request = LaunchRequest::follow_up(
        fx.context("fake-opencode", BaseCodingAgent::Opencode),
        "OPENCODE:cGF0aA==:abc123",
        "again",
    );
    let err = fx.service.follow_up(request).await.unwrap_err();
    assert!(matches!(err, ExecutionError::SessionAlreadyRunning(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn stop_signals_tracked_sessions_only() {
    let fx = Fixture::new(vec![shell_profile(
        "sleeper",
        "CLAUDE_CODE",
        "sleep 30",
        &[],
        false,
    )]);
    assert!(!fx.service.stop_execution("CLAUDE_CODE:eA==:unknown").await);

    let request = LaunchRequest::new_chat(fx.context("sleeper", BaseCodingAgent::ClaudeCode), "x");
    let provisional = request.provisional_composite_id();
    let result = fx.service.spawn_new(request).await.unwrap();
    assert_eq!(result.session_id, provisional);
    assert!(result.process_id.is_some());
    assert!(fx.service.is_running(&result.session_id));

    assert!(fx.service.stop_execution(&result.session_id).await);
    wait_until(|| !fx.service.is_running(&result.session_id)).await;
    assert!(!fx.service.stop_execution(&result.session_id).await);
}

#[tokio::test]
async fn raw_output_is_numbered_stdout_patches() {
    let fx = Fixture::new(vec![shell_profile(
        "echo",
        "GEMINI",
        "echo hi; sleep 0.3",
        &[],
        false,
    )]);
    let request = LaunchRequest::new_chat(fx.context("echo", BaseCodingAgent::Gemini), "x");
    let result = fx.service.spawn_new(request).await.unwrap();

    let stream = fx.service.stream_raw_output(&result.session_id).unwrap();
    let items: Vec<LogMsg> = stream.map(|m| m.unwrap()).collect().await;
    assert_eq!(items.last(), Some(&LogMsg::Finished));

    let first = items
        .iter()
        .find_map(|m| match m {
            LogMsg::JsonPatch(p) => Some(serde_json::to_value(p).unwrap()),
            _ => None,
        })
        .unwrap();
    assert_eq!(first[0]["op"], "add");
    assert_eq!(first[0]["path"], "/entries/0");
    assert_eq!(first[0]["value"]["type"], "STDOUT");
    assert_eq!(first[0]["value"]["content"], "hi\n");

    assert!(fx.service.stream_raw_output("GEMINI:eA==:none").is_none());
}

#[tokio::test]
async fn launch_failures_leave_nothing_registered() {
    let fx = Fixture::new(vec![
        shell_profile("ok", "CODEX", "true", &[], true),
        json!({"label": "missing-bin", "executor": "CODEX",
               "command": {"base": "/definitely/not/a/binary"}, "builder": {"CODEX": {}}}),
    ]);

    let mut ctx = fx.context("ok", BaseCodingAgent::Codex);
    ctx.workspace_path = fx.path("no-such-dir");
    let err = fx
        .service
        .spawn_new(LaunchRequest::new_chat(ctx, "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Workspace(_)));

    let err = fx
        .service
        .spawn_new(LaunchRequest::new_chat(
            fx.context("missing-bin", BaseCodingAgent::Codex),
            "hi",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Spawn(_)));
    assert!(!err.is_retryable());

    let err = fx
        .service
        .spawn_new(LaunchRequest::new_chat(
            fx.context("nope", BaseCodingAgent::Codex),
            "hi",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Configuration(_)));

    let err = fx
        .service
        .spawn_new(LaunchRequest::new_chat(
            fx.context("ok", BaseCodingAgent::Gemini),
            "hi",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Configuration(_)));

    assert!(fx.service.active().is_empty());
}

#[tokio::test]
async fn concurrent_follow_ups_launch_once() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("spawned").to_string_lossy().into_owned();
    let fx = Fixture::new(vec![shell_profile(
        "fake-opencode",
        "OPENCODE",
        r#"echo spawned >> "$0"; sleep 1"#,
        &[&marker],
        true,
    )]);
    let request = || {
        LaunchRequest::follow_up(
            fx.context("fake-opencode", BaseCodingAgent::Opencode),
            "OPENCODE:cGF0aA==:abc123",
            "again",
        )
    };

    let (a, b) = tokio::join!(fx.service.follow_up(request()), fx.service.follow_up(request()));
    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected exactly one launch, got {other:?}"),
    };
    assert_eq!(ok.session_id, "OPENCODE:cGF0aA==:abc123");
    assert!(matches!(err, ExecutionError::SessionAlreadyRunning(_)));
    assert_eq!(fx.service.active().len(), 1);

    wait_until(|| !fx.service.is_running(&ok.session_id)).await;
    assert_eq!(read(Path::new(&marker)).lines().count(), 1);
}

#[tokio::test]
async fn failed_follow_up_releases_its_claim() {
    let fx = Fixture::new(vec![shell_profile("fake-opencode", "OPENCODE", "true", &[], true)]);
    let mut ctx = fx.context("fake-opencode", BaseCodingAgent::Opencode);
    ctx.workspace_path = fx.path("gone");

    let err = fx
        .service
        .follow_up(LaunchRequest::follow_up(ctx, "OPENCODE:cGF0aA==:abc123", "again"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Workspace(_)));
    assert!(!fx.service.is_running("OPENCODE:cGF0aA==:abc123"));
}

fn gemini_chats_dir(root: &Path) -> String {
    let roots = StorageRoots::under(&root.join("home"));
    roots
        .gemini
        .join("tmp")
        .join(project_hash(&root.join("ws")))
        .join("chats")
        .to_string_lossy()
        .into_owned()
}

#[tokio::test]
async fn gemini_session_is_resolved_from_its_chat_file() {
    let script = r#"cat > /dev/null; mkdir -p "$0"; printf '{"sessionId":"g-7","messages":[]}' > "$0/session-1.json"; sleep 2"#;
    let fx = Fixture::build(3_000, |root| {
        vec![shell_profile("fake-gemini", "GEMINI", script, &[&gemini_chats_dir(root)], true)]
    });

    let request =
        LaunchRequest::new_chat(fx.context("fake-gemini", BaseCodingAgent::Gemini), "hello");
    let provisional = request.provisional_composite_id();
    let result = fx.service.spawn_new(request).await.unwrap();

    let resolved = ids::compose_session_id(
        BaseCodingAgent::Gemini,
        &fx.workspace().to_string_lossy(),
        "g-7",
    );
    assert_eq!(result.session_id, resolved);
    assert!(fx.service.is_running(&resolved));
    assert!(!fx.service.is_running(&provisional));

    wait_until(|| !fx.service.is_running(&resolved)).await;
    assert!(fx.service.active().is_empty());
}

#[tokio::test]
async fn unresolved_session_keeps_its_provisional_id() {
    let fx = Fixture::build(300, |_| {
        vec![shell_profile("fake-gemini", "GEMINI", "cat > /dev/null; sleep 3", &[], true)]
    });

    let request =
        LaunchRequest::new_chat(fx.context("fake-gemini", BaseCodingAgent::Gemini), "hello");
    let provisional = request.provisional_composite_id();
    let result = fx.service.spawn_new(request).await.unwrap();

    assert_eq!(result.session_id, provisional);
    assert!(fx.service.is_running(&provisional));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(fx.service.is_running(&provisional));
    assert_eq!(fx.service.active().len(), 1);

    assert!(fx.service.stop_execution(&provisional).await);
    wait_until(|| !fx.service.is_running(&provisional)).await;
}
