use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use executors::{
    executors::{
        BaseCodingAgent,
        opencode::{normalize_logs::OpencodeNormalizer, session},
    },
    logs::utils::EntryIndexProvider,
    storage::modified_time,
};
use json_patch::Patch;
use utils::path::same_workspace;

use super::{
    LogSource, LogSourceError, ProjectAccumulator, ProjectInfo, SessionInfo, SessionReader,
    SourceContext, blocking,
};

/// Rescans a session's message and part records on every poll. The normalizer tracks parts
/// by id, so only new or changed parts produce patches.
pub struct OpencodeSessionReader {
    root: PathBuf,
    session_id: String,
    normalizer: OpencodeNormalizer,
}

impl SessionReader for OpencodeSessionReader {
    fn read_new(&mut self) -> io::Result<Vec<Patch>> {
        let mut patches = Vec::new();
        for message in session::messages(&self.root, &self.session_id)? {
            let parts = session::parts(&self.root, &message.id)?;
            patches.extend(self.normalizer.normalize_message(&message, &parts));
        }
        Ok(patches)
    }
}

/// Project, session, message and part records under `<root>/storage/`.
#[derive(Debug, Clone)]
pub struct OpencodeLogSource {
    root: PathBuf,
    ctx: SourceContext,
}

impl OpencodeLogSource {
    pub fn new(root: impl Into<PathBuf>, ctx: SourceContext) -> Self {
        Self {
            root: root.into(),
            ctx,
        }
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

#[async_trait]
impl LogSource for OpencodeLogSource {
    fn executor(&self) -> BaseCodingAgent {
        BaseCodingAgent::Opencode
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, LogSourceError> {
        let root = self.root.clone();
        blocking(move || {
            let projects = session::projects(&root)?;
            let mut acc = ProjectAccumulator::default();
            for (file, record) in session::sessions(&root)? {
                let Some(workspace) = session::session_workspace(&record, &projects) else {
                    continue;
                };
                acc.touch(&workspace.to_string_lossy(), &workspace, modified_time(&file));
            }
            Ok(acc.into_projects(BaseCodingAgent::Opencode))
        })
        .await
    }

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, LogSourceError> {
        let (root, ctx, key) = (self.root.clone(), self.ctx.clone(), project_key.to_string());
        blocking(move || {
            let projects = session::projects(&root)?;
            Ok(session::sessions(&root)?
                .iter()
                .filter(|(_, record)| {
                    session::session_workspace(record, &projects)
                        .is_some_and(|w| same_workspace(&w, Path::new(&key)))
                })
                .filter_map(|(file, _)| {
                    ctx.session_info(
                        BaseCodingAgent::Opencode,
                        &key,
                        file,
                        session::read_header(&root, file),
                        file_stem(file),
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
            Ok(session::find_session_file(&root, &id).map(|_| {
                Box::new(OpencodeSessionReader {
                    normalizer: OpencodeNormalizer::new(key, EntryIndexProvider::new()),
                    root,
                    session_id: id,
                }) as Box<dyn SessionReader>
            }))
        })
        .await
    }
}
