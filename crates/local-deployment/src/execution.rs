use std::{
    collections::HashMap,
    io,
    path::Path,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::Utc;
use command_group::AsyncGroupChild;
use executors::{
    env::ExecutionEnv,
    executors::{BaseCodingAgent, ExecutorError, LaunchParameters, spawn_agent},
    logs::utils::{ConversationPatch, EntryIndexProvider},
    profile::{ProfileRegistry, ResolvedProfile},
    session_resolver::{
        SessionIdStrategy, poll_filesystem_for_session, scan_stdout_for_session_id,
    },
    storage::StorageRoots,
};
use futures::{
    StreamExt, TryStreamExt,
    future::ready,
    stream::{BoxStream, select},
};
use services::services::{
    active_executions::ActiveExecutions,
    config::TimingConfig,
    execution::{ExecutionError, ExecutionResult, ExecutionService, LaunchKind, LaunchRequest},
    log_source::ids,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use utils::{log_msg::LogMsg, msg_store::MsgStore};
use uuid::Uuid;

use crate::command::{SIGNAL_GRACE, kill_process_group};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One spawned agent process.
struct Execution {
    /// Composite session id the registry currently knows this process by.
    session_id: String,
    child: Arc<Mutex<AsyncGroupChild>>,
    store: Arc<MsgStore>,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Tracked {
    by_id: HashMap<Uuid, Execution>,
    by_session: HashMap<String, Uuid>,
}

/// Runs agents as local child processes, one process group each.
#[derive(Clone)]
pub struct LocalExecutionService {
    profiles: Arc<ProfileRegistry>,
    active: Arc<ActiveExecutions>,
    roots: StorageRoots,
    timing: TimingConfig,
    signal_grace: Duration,
    tracked: Arc<RwLock<Tracked>>,
}

struct Launch<'a> {
    request: &'a LaunchRequest,
    params: LaunchParameters,
    profile: ResolvedProfile,
    /// Project key session ids are composed under.
    project_key: String,
    /// Id registered at spawn time.
    initial_session_id: String,
}

impl LocalExecutionService {
    pub fn new(
        profiles: Arc<ProfileRegistry>,
        active: Arc<ActiveExecutions>,
        roots: StorageRoots,
        timing: TimingConfig,
    ) -> Self {
        Self {
            profiles,
            active,
            roots,
            timing,
            signal_grace: SIGNAL_GRACE,
            tracked: Arc::new(RwLock::new(Tracked::default())),
        }
    }

    pub fn with_signal_grace(mut self, grace: Duration) -> Self {
        self.signal_grace = grace;
        self
    }

    pub fn active(&self) -> &Arc<ActiveExecutions> {
        &self.active
    }

    fn resolve_profile(&self, request: &LaunchRequest) -> Result<ResolvedProfile, ExecutionError> {
        let profile = self.profiles.resolve(&request.context.profile_id())?;
        if profile.executor != request.context.executor {
            return Err(ExecutionError::Configuration(format!(
                "profile `{}` runs {} but the request targets {}",
                profile.id, profile.executor, request.context.executor
            )));
        }
        Ok(profile)
    }

    async fn ensure_workspace(path: &Path) -> Result<(), ExecutionError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(ExecutionError::Workspace(path.to_path_buf())),
        }
    }

    /// Claims the initial session id, then spawns. A launch that fails before the process is
    /// tracked gives the claim back.
    async fn launch(&self, launch: Launch<'_>) -> Result<ExecutionResult, ExecutionError> {
        let session_id = launch.initial_session_id.clone();
        if !self.active.try_register(session_id.clone()) {
            return Err(ExecutionError::SessionAlreadyRunning(session_id));
        }
        let result = self.spawn_claimed(launch).await;
        if result.is_err() {
            self.active.unregister(&session_id);
        }
        result
    }

    async fn spawn_claimed(&self, launch: Launch<'_>) -> Result<ExecutionResult, ExecutionError> {
        let Launch {
            request,
            params,
            profile,
            project_key,
            initial_session_id,
        } = launch;
        let workspace = &request.context.workspace_path;
        Self::ensure_workspace(workspace).await?;

        let env = ExecutionEnv::for_agent().with_profile(&profile.command);
        let not_before = SystemTime::now()
            .checked_sub(self.timing.staleness_allowance())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let started_at = Utc::now();

        let mut child = spawn_agent(&params, workspace, &env)
            .await
            .map_err(|err| match err {
                ExecutorError::CommandBuild(_) => ExecutionError::Configuration(err.to_string()),
                other => ExecutionError::Spawn(other),
            })?;
        let process_id = child.inner().id();
        tracing::info!(
            session_id = %initial_session_id,
            profile = %profile.id,
            pid = ?process_id,
            "Spawned agent"
        );

        let store = Arc::new(MsgStore::new());
        let forwarder = track_child_output(&store, &mut child);
        let exec_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let child = Arc::new(Mutex::new(child));

        {
            let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
            tracked.by_session.insert(initial_session_id.clone(), exec_id);
            tracked.by_id.insert(
                exec_id,
                Execution {
                    session_id: initial_session_id.clone(),
                    child: child.clone(),
                    store: store.clone(),
                    cancel: cancel.clone(),
                    forwarder,
                },
            );
        }
        self.spawn_exit_monitor(exec_id, child);

        let session_id = match params.resolver {
            Some(strategy) => {
                self.resolve_session_id(ResolveArgs {
                    exec_id,
                    strategy,
                    store,
                    cancel,
                    workspace,
                    not_before,
                    executor: profile.executor,
                    project_key: &project_key,
                    provisional: &initial_session_id,
                })
                .await
            }
            None => initial_session_id,
        };

        Ok(ExecutionResult {
            session_id,
            process_id,
            started_at,
            project_id: request.context.project_id.clone(),
            kind: request.kind,
        })
    }

    /// Races the stdout scan against the filesystem poll under the resolution deadline.
    /// Falls back to the provisional id on timeout or stop.
    async fn resolve_session_id(&self, args: ResolveArgs<'_>) -> String {
        let fields = args.strategy.stdout_fields.clone();
        let stdout = {
            let stream = args.store.stdout_chunked_stream();
            let scans = args.strategy.scans_stdout();
            async move {
                if scans {
                    scan_stdout_for_session_id(stream, &fields).await
                } else {
                    None
                }
            }
        };
        let filesystem = {
            let roots = self.roots.clone();
            let workspace = args.workspace.to_path_buf();
            let interval = self.timing.resolution_poll_interval();
            let agent = args.strategy.filesystem;
            let not_before = args.not_before;
            async move {
                match agent {
                    Some(agent) => Some(
                        poll_filesystem_for_session(agent, roots, workspace, not_before, interval)
                            .await,
                    ),
                    None => None,
                }
            }
        };

        let resolved = tokio::select! {
            _ = args.cancel.cancelled() => None,
            result = tokio::time::timeout(
                self.timing.session_resolution_timeout(),
                first_some(stdout, filesystem),
            ) => match result {
                Ok(found) => found,
                Err(_) => {
                    tracing::warn!(
                        session_id = %args.provisional,
                        "Session id not resolved in time, keeping provisional id"
                    );
                    None
                }
            },
        };

        let Some(native_id) = resolved else {
            return args.provisional.to_string();
        };
        let resolved_id = ids::compose_session_id(args.executor, args.project_key, &native_id);
        if self.rename(args.exec_id, &resolved_id) {
            tracing::info!(
                session_id = %resolved_id,
                provisional = %args.provisional,
                "Resolved agent session id"
            );
            args.store.push_session_id(native_id);
        }
        resolved_id
    }

    /// Moves a running execution to its resolved id, in the registry and here together.
    fn rename(&self, exec_id: Uuid, new_id: &str) -> bool {
        let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
        let Some(old_id) = tracked.by_id.get(&exec_id).map(|e| e.session_id.clone()) else {
            return false;
        };
        if old_id == new_id {
            return true;
        }
        self.active.update_session_id(&old_id, new_id);
        tracked.by_session.remove(&old_id);
        tracked.by_session.insert(new_id.to_string(), exec_id);
        if let Some(execution) = tracked.by_id.get_mut(&exec_id) {
            execution.session_id = new_id.to_string();
        }
        true
    }

    fn spawn_exit_monitor(&self, exec_id: Uuid, child: Arc<Mutex<AsyncGroupChild>>) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let status = child.lock().await.try_wait();
                match status {
                    Ok(Some(status)) => {
                        tracing::info!(exec_id = %exec_id, "Agent exited with {status}");
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(exec_id = %exec_id, "Lost track of agent process: {e}");
                        break;
                    }
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
            service.finalize(exec_id).await;
        });
    }

    /// Exit bookkeeping. Runs once per execution whichever path observes the exit first.
    async fn finalize(&self, exec_id: Uuid) {
        let execution = {
            let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
            let Some(execution) = tracked.by_id.remove(&exec_id) else {
                return;
            };
            tracked.by_session.remove(&execution.session_id);
            self.active.unregister(&execution.session_id);
            execution
        };
        execution.cancel.cancel();
        if let Some(forwarder) = execution.forwarder
            && tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, forwarder)
                .await
                .is_err()
        {
            tracing::debug!(exec_id = %exec_id, "Output pipes still open after exit");
        }
        execution.store.push_finished();
        tracing::debug!(session_id = %execution.session_id, "Execution finished");
    }

    fn lookup(
        &self,
        session_id: &str,
    ) -> Option<(Uuid, Arc<Mutex<AsyncGroupChild>>, CancellationToken)> {
        let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
        let exec_id = *tracked.by_session.get(session_id)?;
        let execution = tracked.by_id.get(&exec_id)?;
        Some((exec_id, execution.child.clone(), execution.cancel.clone()))
    }
}

struct ResolveArgs<'a> {
    exec_id: Uuid,
    strategy: SessionIdStrategy,
    store: Arc<MsgStore>,
    cancel: CancellationToken,
    workspace: &'a Path,
    not_before: SystemTime,
    executor: BaseCodingAgent,
    project_key: &'a str,
    provisional: &'a str,
}

/// First `Some` of two futures. A `None` only ends the race once both are done.
async fn first_some<A, B, T>(a: A, b: B) -> Option<T>
where
    A: Future<Output = Option<T>>,
    B: Future<Output = Option<T>>,
{
    tokio::pin!(a, b);
    let (mut a_done, mut b_done) = (false, false);
    loop {
        tokio::select! {
            found = &mut a, if !a_done => match found {
                Some(v) => return Some(v),
                None => a_done = true,
            },
            found = &mut b, if !b_done => match found {
                Some(v) => return Some(v),
                None => b_done = true,
            },
            else => return None,
        }
    }
}

/// Forward the child's stdout and stderr into `store` as raw chunks.
fn track_child_output(
    store: &Arc<MsgStore>,
    child: &mut AsyncGroupChild,
) -> Option<JoinHandle<()>> {
    let (Some(out), Some(err)) = (child.inner().stdout.take(), child.inner().stderr.take()) else {
        tracing::warn!("Agent spawned without piped output");
        return None;
    };
    let out = ReaderStream::new(out)
        .map_ok(|chunk| LogMsg::Stdout(String::from_utf8_lossy(&chunk).into_owned()));
    let err = ReaderStream::new(err)
        .map_ok(|chunk| LogMsg::Stderr(String::from_utf8_lossy(&chunk).into_owned()));
    Some(store.clone().spawn_forwarder(select(out, err)))
}

#[async_trait]
impl ExecutionService for LocalExecutionService {
    async fn spawn_new(&self, request: LaunchRequest) -> Result<ExecutionResult, ExecutionError> {
        if request.kind != LaunchKind::New {
            return Err(ExecutionError::Configuration(
                "spawn_new called with a follow-up request".to_string(),
            ));
        }
        let profile = self.resolve_profile(&request)?;
        let params = profile
            .initial(&request.prompt)
            .map_err(|e| ExecutionError::Configuration(e.to_string()))?;

        self.launch(Launch {
            project_key: request.context.project_key(),
            initial_session_id: request.provisional_composite_id(),
            request: &request,
            params,
            profile,
        })
        .await
    }

    async fn follow_up(&self, request: LaunchRequest) -> Result<ExecutionResult, ExecutionError> {
        if request.kind != LaunchKind::FollowUp {
            return Err(ExecutionError::Configuration(
                "follow_up called with a new-chat request".to_string(),
            ));
        }
        let target = request.target_session()?;
        let target_id = target.to_string();
        let profile = self.resolve_profile(&request)?;
        let params = profile
            .follow_up(&target.native_id, &request.prompt)
            .map_err(|e| ExecutionError::Configuration(e.to_string()))?;

        self.launch(Launch {
            project_key: target.project_key.clone(),
            initial_session_id: target_id,
            request: &request,
            params,
            profile,
        })
        .await
    }

    async fn stop_execution(&self, session_id: &str) -> bool {
        let Some((exec_id, child, cancel)) = self.lookup(session_id) else {
            tracing::debug!(session_id = %session_id, "Stop requested for untracked session");
            return false;
        };
        tracing::info!(session_id = %session_id, "Stopping execution");
        cancel.cancel();

        let service = self.clone();
        let grace = self.signal_grace;
        tokio::spawn(async move {
            {
                let mut child = child.lock().await;
                if let Err(e) = kill_process_group(&mut child, grace).await {
                    tracing::error!(exec_id = %exec_id, "Failed to stop agent process: {e}");
                }
            }
            service.finalize(exec_id).await;
        });
        true
    }

    fn is_running(&self, session_id: &str) -> bool {
        self.active.is_active(session_id)
    }

    fn stream_raw_output(
        &self,
        session_id: &str,
    ) -> Option<BoxStream<'static, Result<LogMsg, io::Error>>> {
        let store = {
            let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
            let exec_id = tracked.by_session.get(session_id)?;
            tracked.by_id.get(exec_id)?.store.clone()
        };
        let index = EntryIndexProvider::start_from_store(&store);
        Some(
            store
                .history_plus_stream()
                .filter_map(move |item| {
                    let mapped = match item {
                        Ok(LogMsg::Stdout(chunk)) => Some(Ok(LogMsg::JsonPatch(
                            ConversationPatch::add_stdout(index.next(), chunk),
                        ))),
                        Ok(LogMsg::Stderr(chunk)) => Some(Ok(LogMsg::JsonPatch(
                            ConversationPatch::add_stderr(index.next(), chunk),
                        ))),
                        Ok(LogMsg::JsonPatch(_)) => None,
                        other => Some(other),
                    };
                    ready(mapped)
                })
                .boxed(),
        )
    }
}
