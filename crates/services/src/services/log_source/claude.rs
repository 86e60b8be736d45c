use std::path::{Path, PathBuf};

use async_trait::async_trait;
use executors::{
    executors::{
        BaseCodingAgent,
        claude::{normalize_logs::ClaudeLogNormalizer, session},
    },
    logs::utils::EntryIndexProvider,
    storage::modified_time,
};
use utils::path::same_workspace;

use super::{
    LogSource, LogSourceError, ProjectAccumulator, ProjectInfo, SessionInfo, SessionReader,
    SourceContext, blocking, tail::JsonlReader,
};

/// `<root>/projects/<encoded cwd>/<uuid>.jsonl`
#[derive(Debug, Clone)]
pub struct ClaudeLogSource {
    root: PathBuf,
    ctx: SourceContext,
}

impl ClaudeLogSource {
    pub fn new(root: impl Into<PathBuf>, ctx: SourceContext) -> Self {
        Self {
            root: root.into(),
            ctx,
        }
    }

    fn project_dir(root: &Path, key: &str) -> Option<PathBuf> {
        let direct = session::projects_dir(root).join(session::encode_project_dir(Path::new(key)));
        if direct.is_dir() {
            return Some(direct);
        }
        session::project_dirs(root)
            .ok()?
            .into_iter()
            .find(|dir| same_workspace(&session::project_path(dir), Path::new(key)))
    }
}

#[async_trait]
impl LogSource for ClaudeLogSource {
    fn executor(&self) -> BaseCodingAgent {
        BaseCodingAgent::ClaudeCode
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, LogSourceError> {
        let root = self.root.clone();
        blocking(move || {
            let mut acc = ProjectAccumulator::default();
            for dir in session::project_dirs(&root)? {
                let path = session::project_path(&dir);
                let key = path.to_string_lossy().into_owned();
                let files = session::session_files(&dir)?;
                if files.is_empty() {
                    acc.touch(&key, &path, modified_time(&dir));
                }
                for file in files {
                    acc.touch(&key, &path, modified_time(&file));
                }
            }
            Ok(acc.into_projects(BaseCodingAgent::ClaudeCode))
        })
        .await
    }

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, LogSourceError> {
        let (root, ctx, key) = (self.root.clone(), self.ctx.clone(), project_key.to_string());
        blocking(move || {
            let Some(dir) = Self::project_dir(&root, &key) else {
                return Ok(Vec::new());
            };
            Ok(session::session_files(&dir)?
                .iter()
                .filter_map(|file| {
                    ctx.session_info(
                        BaseCodingAgent::ClaudeCode,
                        &key,
                        file,
                        session::read_header(file),
                        session::native_id(file),
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
            Ok(session::find_session_file(&root, Path::new(&key), &id).map(|path| {
                let normalizer = ClaudeLogNormalizer::new(key, EntryIndexProvider::new());
                Box::new(JsonlReader::new(path, normalizer)) as Box<dyn SessionReader>
            }))
        })
        .await
    }
}
