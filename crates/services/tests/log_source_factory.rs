use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use executors::{
    executors::{BaseCodingAgent, claude, gemini},
    storage::StorageRoots,
};
use futures::StreamExt;
use serde_json::{Value, json};
use services::services::{
    active_executions::ActiveExecutions,
    config::TimingConfig,
    log_source::{LogSourceError, LogSourceFactory, ids},
};
use utils::log_msg::LogMsg;

fn timing() -> TimingConfig {
    TimingConfig {
        tail_poll_interval_ms: 10,
        session_lookup_attempts: 3,
        session_lookup_delay_ms: 10,
        ..TimingConfig::default()
    }
}

fn claude_transcript(roots: &StorageRoots, workspace: &str, id: &str) -> PathBuf {
    let dir = claude::session::projects_dir(&roots.claude)
        .join(claude::session::encode_project_dir(Path::new(workspace)));
    fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{id}.jsonl"))
}

fn user(text: &str) -> Value {
    json!({"type": "user", "sessionId": "s1", "cwd": "/work/app",
           "message": {"role": "user", "content": text}})
}

fn assistant(text: &str) -> Value {
    json!({"type": "assistant", "sessionId": "s1", "cwd": "/work/app",
           "message": {"role": "assistant", "content": [{"type": "text", "text": text}]}})
}

fn append(path: &Path, records: &[Value]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for record in records {
        writeln!(file, "{record}").unwrap();
    }
}

fn add_indices(items: &[LogMsg]) -> Vec<usize> {
    items
        .iter()
        .filter_map(|msg| match msg {
            LogMsg::JsonPatch(patch) => {
                let value = serde_json::to_value(patch).unwrap();
                let op = &value[0];
                assert_eq!(op["op"], "add");
                op["path"]
                    .as_str()
                    .and_then(|p| p.strip_prefix("/entries/"))
                    .and_then(|n| n.parse().ok())
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn completed_session_replays_in_order_then_finishes() {
    let home = tempfile::tempdir().unwrap();
    let roots = StorageRoots::under(home.path());
    let path = claude_transcript(&roots, "/work/app", "s1");
    append(
        &path,
        &[user("add tests"), assistant("Adding them now."), user("thanks")],
    );

    let factory = LogSourceFactory::new(&roots, Arc::new(ActiveExecutions::new()), timing());
    let id = ids::compose_session_id(BaseCodingAgent::ClaudeCode, "/work/app", "s1");
    let items: Vec<LogMsg> = factory
        .get_session_stream(&id)
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(items.len(), 4);
    assert_eq!(add_indices(&items), vec![0, 1, 2]);
    assert_eq!(items.last(), Some(&LogMsg::Finished));
}

#[tokio::test]
async fn live_session_is_tailed_until_process_leaves_registry() {
    let home = tempfile::tempdir().unwrap();
    let roots = StorageRoots::under(home.path());
    let path = claude_transcript(&roots, "/work/app", "s1");
    append(&path, &[user("start")]);

    let active = Arc::new(ActiveExecutions::new());
    let id = ids::compose_session_id(BaseCodingAgent::ClaudeCode, "/work/app", "s1");
    active.register(id.clone());

    let factory = LogSourceFactory::new(&roots, active.clone(), timing());
    let mut stream = factory.get_session_stream(&id).await.unwrap();
    assert!(matches!(stream.next().await, Some(Ok(LogMsg::JsonPatch(_)))));

    append(&path, &[assistant("working")]);
    assert!(matches!(stream.next().await, Some(Ok(LogMsg::JsonPatch(_)))));

    active.unregister(&id);
    let rest: Vec<_> = stream.collect().await;
    assert!(matches!(rest.last(), Some(Ok(LogMsg::Finished))));
}

#[tokio::test]
async fn session_created_after_lookup_started_is_found() {
    let home = tempfile::tempdir().unwrap();
    let roots = StorageRoots::under(home.path());
    let path = claude_transcript(&roots, "/work/app", "s1");

    let active = Arc::new(ActiveExecutions::new());
    let id = ids::compose_session_id(BaseCodingAgent::ClaudeCode, "/work/app", "s1");
    active.register(id.clone());
    let factory = LogSourceFactory::new(
        &roots,
        active.clone(),
        TimingConfig {
            session_lookup_attempts: 20,
            session_lookup_delay_ms: 20,
            ..timing()
        },
    );

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        append(&path, &[user("late start")]);
    });
    let mut stream = factory.get_session_stream(&id).await.unwrap();
    writer.await.unwrap();
    assert!(matches!(stream.next().await, Some(Ok(LogMsg::JsonPatch(_)))));
    active.unregister(&id);
}

#[tokio::test]
async fn missing_session_of_running_process_is_not_found_after_retries() {
    let home = tempfile::tempdir().unwrap();
    let roots = StorageRoots::under(home.path());
    let active = Arc::new(ActiveExecutions::new());
    let id = ids::compose_session_id(BaseCodingAgent::Codex, "/work/app", "never");
    active.register(id.clone());

    let factory = LogSourceFactory::new(&roots, active, timing());
    let started = std::time::Instant::now();
    let result = factory.get_session_stream(&id).await;
    assert!(matches!(result, Err(LogSourceError::SessionNotFound(_))));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test]
async fn listings_route_by_executor_prefix() {
    let home = tempfile::tempdir().unwrap();
    let roots = StorageRoots::under(home.path());
    append(&claude_transcript(&roots, "/work/app", "s1"), &[user("hello")]);

    let gemini_dir = gemini::session::tmp_dir(&roots.gemini)
        .join(gemini::session::project_hash(Path::new("/work/gem")));
    fs::create_dir_all(gemini_dir.join("chats")).unwrap();
    fs::write(gemini_dir.join(".project_root"), "/work/gem").unwrap();
    fs::write(
        gemini_dir.join("chats/session-2025-06-01T10-00-g1.json"),
        json!({"sessionId": "g1", "messages": [{"id": "m1", "type": "user", "content": "hey"}]})
            .to_string(),
    )
    .unwrap();

    let factory = LogSourceFactory::new(&roots, Arc::new(ActiveExecutions::new()), timing());

    let all = factory.get_all_projects(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let gemini_only = factory
        .get_all_projects(Some(BaseCodingAgent::Gemini))
        .await
        .unwrap();
    assert_eq!(gemini_only.len(), 1);
    assert_eq!(gemini_only[0].git_repo_path, "/work/gem");

    let sessions = factory
        .get_sessions_for_project(&gemini_only[0].id)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0].id,
        ids::compose_session_id(BaseCodingAgent::Gemini, "/work/gem", "g1")
    );

    let claude_project = ids::compose_project_id(BaseCodingAgent::ClaudeCode, "/work/app");
    let claude_sessions = factory.get_sessions_for_project(&claude_project).await.unwrap();
    assert_eq!(claude_sessions.len(), 1);
    assert_eq!(claude_sessions[0].first_user_message.as_deref(), Some("hello"));

    assert!(matches!(
        factory.get_sessions_for_project("CURSOR:eA==").await,
        Err(LogSourceError::UnknownExecutor(_))
    ));
    assert!(factory.get_all_projects(Some(BaseCodingAgent::Opencode)).await.unwrap().is_empty());
}

#[test]
fn composite_ids_round_trip() {
    for path in ["/home/me/app", "/tmp/a:b", "/data/プロジェクト"] {
        let project = ids::compose_project_id(BaseCodingAgent::Codex, path);
        let parsed = ids::parse_project_id(&project).unwrap();
        assert_eq!(parsed.executor, BaseCodingAgent::Codex);
        assert_eq!(parsed.key, path);

        let session = ids::compose_session_id(BaseCodingAgent::Codex, path, "n:1");
        let parsed = ids::parse_session_id(&session).unwrap();
        assert_eq!(parsed.project_key, path);
        assert_eq!(parsed.native_id, "n:1");
    }
}
