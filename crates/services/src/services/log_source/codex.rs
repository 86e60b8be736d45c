use std::path::{Path, PathBuf};

use async_trait::async_trait;
use executors::{
    executors::{
        BaseCodingAgent,
        codex::{normalize_logs::CodexLogNormalizer, session},
    },
    logs::utils::EntryIndexProvider,
    storage::modified_time,
};
use utils::path::same_workspace;

use super::{
    LogSource, LogSourceError, ProjectAccumulator, ProjectInfo, SessionInfo, SessionReader,
    SourceContext, blocking, tail::JsonlReader,
};

/// Date-partitioned rollouts grouped into projects by their recorded `cwd`.
#[derive(Debug, Clone)]
pub struct CodexLogSource {
    root: PathBuf,
    ctx: SourceContext,
}

impl CodexLogSource {
    pub fn new(root: impl Into<PathBuf>, ctx: SourceContext) -> Self {
        Self {
            root: root.into(),
            ctx,
        }
    }
}

#[async_trait]
impl LogSource for CodexLogSource {
    fn executor(&self) -> BaseCodingAgent {
        BaseCodingAgent::Codex
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, LogSourceError> {
        let root = self.root.clone();
        blocking(move || {
            let mut acc = ProjectAccumulator::default();
            for file in session::rollout_files(&root) {
                let Some(cwd) = session::read_meta(&file).ok().and_then(|m| m.cwd) else {
                    tracing::debug!(path = %file.display(), "Rollout without cwd");
                    continue;
                };
                acc.touch(&cwd.to_string_lossy(), &cwd, modified_time(&file));
            }
            Ok(acc.into_projects(BaseCodingAgent::Codex))
        })
        .await
    }

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, LogSourceError> {
        let (root, ctx, key) = (self.root.clone(), self.ctx.clone(), project_key.to_string());
        blocking(move || {
            let workspace = Path::new(&key);
            Ok(session::rollout_files(&root)
                .iter()
                .filter(|file| {
                    session::read_meta(file)
                        .ok()
                        .and_then(|m| m.cwd)
                        .is_some_and(|cwd| same_workspace(&cwd, workspace))
                })
                .filter_map(|file| {
                    ctx.session_info(
                        BaseCodingAgent::Codex,
                        &key,
                        file,
                        session::read_header(file),
                        session::extract_session_id_from_rollout_path(file),
                    )
                })
                .collect())
        })
        .await
    }

    async fn open_session(
        &self,
        project_key: &str,
        native_id: &str,
    ) -> Result<Option<Box<dyn SessionReader>>, LogSourceError> {
        let (root, key, id) = (self.root.clone(), project_key.to_string(), native_id.to_string());
        blocking(move || {
            Ok(session::find_session_file(&root, &id).map(|path| {
                let normalizer = CodexLogNormalizer::new(key, EntryIndexProvider::new());
                Box::new(JsonlReader::new(path, normalizer)) as Box<dyn SessionReader>
            }))
        })
        .await
    }
}
