use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use executors::{
    executors::{
        BaseCodingAgent,
        gemini::{normalize_logs::GeminiSessionNormalizer, session},
    },
    logs::utils::EntryIndexProvider,
    storage::{file_name_str, modified_time},
};
use json_patch::Patch;

use super::{
    LogSource, LogSourceError, ProjectAccumulator, ProjectInfo, SessionInfo, SessionReader,
    SourceContext, blocking,
};

/// Gemini rewrites its chat document in place, so the reader re-parses the whole file
/// whenever its size or mtime moves.
pub struct GeminiSessionReader {
    path: PathBuf,
    last_seen: Option<(u64, Option<SystemTime>)>,
    normalizer: GeminiSessionNormalizer,
}

impl GeminiSessionReader {
    pub fn new(path: PathBuf, normalizer: GeminiSessionNormalizer) -> Self {
        Self {
            path,
            last_seen: None,
            normalizer,
        }
    }
}

impl SessionReader for GeminiSessionReader {
    fn read_new(&mut self) -> io::Result<Vec<Patch>> {
        let metadata = fs::metadata(&self.path)?;
        let stamp = (metadata.len(), metadata.modified().ok());
        if self.last_seen == Some(stamp) {
            return Ok(Vec::new());
        }
        match session::read_session(&self.path) {
            Ok(document) => {
                self.last_seen = Some(stamp);
                Ok(self.normalizer.normalize_document(&document))
            }
            // caught mid-rewrite; the next poll sees the finished document
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::debug!(path = %self.path.display(), "Gemini chat not parseable yet: {err}");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

/// Chats under `<root>/tmp/<sha256(project)>/chats/`.
#[derive(Debug, Clone)]
pub struct GeminiLogSource {
    root: PathBuf,
    ctx: SourceContext,
}

impl GeminiLogSource {
    pub fn new(root: impl Into<PathBuf>, ctx: SourceContext) -> Self {
        Self {
            root: root.into(),
            ctx,
        }
    }

    /// The recorded project path, else the hash directory name.
    fn project_key(dir: &Path) -> (String, PathBuf) {
        match session::project_root(dir) {
            Some(path) => (path.to_string_lossy().into_owned(), path),
            None => (file_name_str(dir).to_string(), dir.to_path_buf()),
        }
    }
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

#[async_trait]
impl LogSource for GeminiLogSource {
    fn executor(&self) -> BaseCodingAgent {
        BaseCodingAgent::Gemini
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, LogSourceError> {
        let root = self.root.clone();
        blocking(move || {
            let mut acc = ProjectAccumulator::default();
            for dir in session::project_dirs(&root)? {
                let (key, path) = Self::project_key(&dir);
                let files = session::session_files(&dir)?;
                if files.is_empty() {
                    acc.touch(&key, &path, modified_time(&dir));
                }
                for file in files {
                    acc.touch(&key, &path, modified_time(&file));
                }
            }
            Ok(acc.into_projects(BaseCodingAgent::Gemini))
        })
        .await
    }

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, LogSourceError> {
        let (root, ctx, key) = (self.root.clone(), self.ctx.clone(), project_key.to_string());
        blocking(move || {
            let Some(dir) = session::resolve_project_dir(&root, &key) else {
                return Ok(Vec::new());
            };
            Ok(session::session_files(&dir)?
                .iter()
                .filter_map(|file| {
                    ctx.session_info(
                        BaseCodingAgent::Gemini,
                        &key,
                        file,
                        session::read_header(file),
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
            Ok(session::find_session_file(&root, &key, &id).map(|path| {
                let normalizer = GeminiSessionNormalizer::new(key, EntryIndexProvider::new());
                Box::new(GeminiSessionReader::new(path, normalizer)) as Box<dyn SessionReader>
            }))
        })
        .await
    }
}
