//! Shared tail driver: replay for finished sessions, polling tail for live ones.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use executors::logs::LineNormalizer;
use futures::StreamExt;
use json_patch::Patch;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use utils::log_msg::LogMsg;

use super::{LogSourceError, LogStream};
use crate::services::active_executions::ActiveExecutions;

const CHANNEL_CAPACITY: usize = 256;

/// Incremental reader over one session's storage.
pub trait SessionReader: Send {
    /// Patches produced since the previous call.
    fn read_new(&mut self) -> io::Result<Vec<Patch>>;

    /// Called once before the stream finishes; flushes anything held back as incomplete.
    fn finish(&mut self) -> io::Result<Vec<Patch>> {
        Ok(Vec::new())
    }
}

/// JSONL transcript reader. Tracks a byte offset and holds back a trailing partial line.
pub struct JsonlReader<N> {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    normalizer: N,
}

impl<N: LineNormalizer> JsonlReader<N> {
    pub fn new(path: impl Into<PathBuf>, normalizer: N) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
            normalizer,
        }
    }

    fn normalize(&mut self, line: &[u8]) -> Vec<Patch> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        self.normalizer.normalize_line(line)
    }
}

impl<N: LineNormalizer> SessionReader for JsonlReader<N> {
    fn read_new(&mut self) -> io::Result<Vec<Patch>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "Session file truncated, rereading");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        let read = file.take(len - self.offset).read_to_end(&mut chunk)?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&chunk);

        let mut patches = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            patches.extend(self.normalize(&line));
        }
        Ok(patches)
    }

    fn finish(&mut self) -> io::Result<Vec<Patch>> {
        let rest = std::mem::take(&mut self.partial);
        Ok(self.normalize(&rest))
    }
}

async fn run_blocking<T, F>(
    reader: Box<dyn SessionReader>,
    f: F,
) -> (Box<dyn SessionReader>, io::Result<T>)
where
    F: FnOnce(&mut Box<dyn SessionReader>) -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let result = f(&mut reader);
        (reader, result)
    });
    match handle.await {
        Ok(done) => done,
        // the reader went down with the panicking task
        Err(err) => (
            Box::new(Exhausted) as Box<dyn SessionReader>,
            Err(io::Error::other(err)),
        ),
    }
}

struct Exhausted;

impl SessionReader for Exhausted {
    fn read_new(&mut self) -> io::Result<Vec<Patch>> {
        Ok(Vec::new())
    }
}

/// Sends patches; `false` once the consumer has gone away.
async fn forward(
    tx: &mpsc::Sender<Result<LogMsg, LogSourceError>>,
    patches: Vec<Patch>,
) -> bool {
    for patch in patches {
        if tx.send(Ok(LogMsg::JsonPatch(patch))).await.is_err() {
            return false;
        }
    }
    true
}

/// Stream a session. When `session_id` is not active this is a one-shot replay; otherwise
/// the reader is polled until the registry drops the id and a final read finds nothing new.
pub fn session_stream(
    reader: Box<dyn SessionReader>,
    active: Arc<ActiveExecutions>,
    session_id: String,
    poll_interval: Duration,
) -> LogStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let live = active.is_active(&session_id);
        tracing::debug!(session_id = %session_id, live, "Starting session stream");
        let mut reader = reader;

        loop {
            let was_active = active.is_active(&session_id);
            let (back, result) = run_blocking(reader, |r| r.read_new()).await;
            reader = back;
            let patches = match result {
                Ok(patches) => patches,
                Err(err) => {
                    tracing::warn!(session_id = %session_id, "Session read failed: {err}");
                    let _ = tx.send(Err(LogSourceError::StreamIo(err))).await;
                    return;
                }
            };
            let produced = !patches.is_empty();
            if !forward(&tx, patches).await {
                return;
            }
            if !live || (!was_active && !produced) {
                break;
            }
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        let (_, result) = run_blocking(reader, |r| r.finish()).await;
        match result {
            Ok(patches) => {
                if !forward(&tx, patches).await {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(LogSourceError::StreamIo(err))).await;
                return;
            }
        }
        let _ = tx.send(Ok(LogMsg::Finished)).await;
        tracing::debug!(session_id = %session_id, "Session stream finished");
    });

    ReceiverStream::new(rx).boxed()
}
