use std::{collections::HashMap, sync::Arc};

use backon::{ConstantBuilder, Retryable};
use executors::{executors::BaseCodingAgent, storage::StorageRoots};
use strum::IntoEnumIterator;

use super::{
    LogSource, LogSourceError, LogStream, ProjectInfo, SessionInfo, SourceContext,
    claude::ClaudeLogSource, codex::CodexLogSource, gemini::GeminiLogSource, ids,
    opencode::OpencodeLogSource, tail,
};
use crate::services::{active_executions::ActiveExecutions, config::TimingConfig};

/// Routes composite ids to the source of their executor.
#[derive(Clone)]
pub struct LogSourceFactory {
    sources: HashMap<BaseCodingAgent, Arc<dyn LogSource>>,
    active: Arc<ActiveExecutions>,
    timing: TimingConfig,
}

impl LogSourceFactory {
    /// One source per executor, each rooted at its configured storage directory.
    pub fn new(roots: &StorageRoots, active: Arc<ActiveExecutions>, timing: TimingConfig) -> Self {
        let ctx = SourceContext::new(active.clone(), timing.running_window());
        let sources = BaseCodingAgent::iter()
            .map(|executor| {
                let root = roots.root_for(executor).to_path_buf();
                let source: Arc<dyn LogSource> = match executor {
                    BaseCodingAgent::ClaudeCode => Arc::new(ClaudeLogSource::new(root, ctx.clone())),
                    BaseCodingAgent::Codex => Arc::new(CodexLogSource::new(root, ctx.clone())),
                    BaseCodingAgent::Gemini => Arc::new(GeminiLogSource::new(root, ctx.clone())),
                    BaseCodingAgent::Opencode => {
                        Arc::new(OpencodeLogSource::new(root, ctx.clone()))
                    }
                };
                source
            })
            .collect::<Vec<_>>();
        Self::with_sources(sources, active, timing)
    }

    pub fn with_sources(
        sources: Vec<Arc<dyn LogSource>>,
        active: Arc<ActiveExecutions>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.executor(), s)).collect(),
            active,
            timing,
        }
    }

    pub fn active(&self) -> &Arc<ActiveExecutions> {
        &self.active
    }

    fn source(&self, executor: BaseCodingAgent) -> Result<&Arc<dyn LogSource>, LogSourceError> {
        self.sources
            .get(&executor)
            .ok_or_else(|| LogSourceError::UnknownExecutor(executor.to_string()))
    }

    /// Projects of every source, or of one executor, newest first. A source that fails to
    /// list is logged and left out.
    pub async fn get_all_projects(
        &self,
        executor: Option<BaseCodingAgent>,
    ) -> Result<Vec<ProjectInfo>, LogSourceError> {
        if let Some(executor) = executor {
            let mut projects = self.source(executor)?.list_projects().await?;
            projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            return Ok(projects);
        }

        let mut projects = Vec::new();
        for source in self.sources.values() {
            match source.list_projects().await {
                Ok(found) => projects.extend(found),
                Err(err) => {
                    tracing::warn!(executor = %source.executor(), "Failed to list projects: {err}")
                }
            }
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(projects)
    }

    pub async fn get_sessions_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<SessionInfo>, LogSourceError> {
        let project = ids::parse_project_id(project_id)?;
        let mut sessions = self
            .source(project.executor)?
            .list_sessions(&project.key)
            .await?;
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    /// Patch stream of one session. When the session is registered active but its storage
    /// has not appeared yet, the lookup is retried at a fixed delay.
    pub async fn get_session_stream(&self, session_id: &str) -> Result<LogStream, LogSourceError> {
        let id = ids::parse_session_id(session_id)?;
        let source = self.source(id.executor)?.clone();

        let open = || {
            let source = source.clone();
            let id = id.clone();
            async move {
                source
                    .open_session(&id.project_key, &id.native_id)
                    .await?
                    .ok_or_else(|| LogSourceError::SessionNotFound(id.to_string()))
            }
        };

        let reader = if self.active.is_active(session_id) {
            let retries = self.timing.session_lookup_attempts.saturating_sub(1);
            open.retry(
                ConstantBuilder::default()
                    .with_delay(self.timing.session_lookup_delay())
                    .with_max_times(retries),
            )
            .when(LogSourceError::is_retryable)
            .notify(|err, delay| {
                tracing::debug!(
                    session_id = %session_id,
                    "Session not visible yet, retrying after {:.2}s: {err}",
                    delay.as_secs_f64()
                )
            })
            .await?
        } else {
            open().await?
        };

        Ok(tail::session_stream(
            reader,
            self.active.clone(),
            session_id.to_string(),
            self.timing.tail_poll_interval(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::services::log_source::SessionReader;

    /// Counts open attempts and never finds a session.
    struct Empty {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl LogSource for Empty {
        fn executor(&self) -> BaseCodingAgent {
            BaseCodingAgent::Codex
        }

        async fn list_projects(&self) -> Result<Vec<ProjectInfo>, LogSourceError> {
            Ok(Vec::new())
        }

        async fn list_sessions(&self, _: &str) -> Result<Vec<SessionInfo>, LogSourceError> {
            Ok(Vec::new())
        }

        async fn open_session(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<Box<dyn SessionReader>>, LogSourceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    fn timing() -> TimingConfig {
        TimingConfig {
            session_lookup_attempts: 4,
            session_lookup_delay_ms: 5,
            ..TimingConfig::default()
        }
    }

    fn factory() -> (LogSourceFactory, Arc<Empty>, Arc<ActiveExecutions>) {
        let source = Arc::new(Empty {
            opens: AtomicUsize::new(0),
        });
        let active = Arc::new(ActiveExecutions::new());
        let factory = LogSourceFactory::with_sources(vec![source.clone()], active.clone(), timing());
        (factory, source, active)
    }

    #[tokio::test]
    async fn active_session_lookup_is_retried() {
        let (factory, source, active) = factory();
        let id = ids::compose_session_id(BaseCodingAgent::Codex, "/work", "pending");
        active.register(id.clone());

        let started = std::time::Instant::now();
        let err = factory.get_session_stream(&id).await.err().unwrap();
        assert!(matches!(err, LogSourceError::SessionNotFound(_)));
        assert_eq!(source.opens.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn inactive_session_lookup_fails_at_once() {
        let (factory, source, _) = factory();
        let id = ids::compose_session_id(BaseCodingAgent::Codex, "/work", "gone");
        let err = factory.get_session_stream(&id).await.err().unwrap();
        assert!(matches!(err, LogSourceError::SessionNotFound(_)));
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_executor_is_reported() {
        let (factory, _, _) = factory();
        let id = ids::compose_session_id(BaseCodingAgent::Gemini, "/work", "s");
        assert!(matches!(
            factory.get_session_stream(&id).await.err(),
            Some(LogSourceError::UnknownExecutor(_))
        ));
        assert!(matches!(
            factory.get_sessions_for_project("NOPE:eA==").await,
            Err(LogSourceError::UnknownExecutor(_))
        ));
        assert!(matches!(
            factory.get_all_projects(Some(BaseCodingAgent::Gemini)).await,
            Err(LogSourceError::UnknownExecutor(_))
        ));
    }
}
