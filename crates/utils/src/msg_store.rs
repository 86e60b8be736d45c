use std::{
    collections::VecDeque,
    io,
    sync::{Arc, RwLock},
};

use futures::{Stream, StreamExt, stream::BoxStream};
use json_patch::Patch;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::BroadcastStream;

use crate::log_msg::LogMsg;

// 100 MiB of history per store
const HISTORY_BYTES: usize = 100 * 1024 * 1024;
const CHANNEL_CAPACITY: usize = 10_000;

#[derive(Clone)]
struct StoredMsg {
    msg: LogMsg,
    bytes: usize,
}

#[derive(Default)]
struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
}

/// Ordered outbound channel for one execution: a byte-budgeted history plus a broadcast
/// to live subscribers. Late subscribers get the history first, then live messages.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogMsg>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            sender,
        }
    }

    pub fn push(&self, msg: LogMsg) {
        let bytes = msg.approx_bytes();
        // history append and broadcast happen under one write lock so a subscriber taking
        // its snapshot never sees a message twice or misses one
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            match inner.history.pop_front() {
                Some(front) => inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes),
                None => break,
            }
        }
        inner.history.push_back(StoredMsg {
            msg: msg.clone(),
            bytes,
        });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        let _ = self.sender.send(msg);
    }

    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stdout(s.into()));
    }

    pub fn push_stderr<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stderr(s.into()));
    }

    pub fn push_patch(&self, patch: Patch) {
        self.push(LogMsg::JsonPatch(patch));
    }

    pub fn push_session_id(&self, session_id: String) {
        self.push(LogMsg::SessionId(session_id));
    }

    pub fn push_finished(&self) {
        self.push(LogMsg::Finished);
    }

    pub fn get_history(&self) -> Vec<LogMsg> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.history.iter().map(|s| s.msg.clone()).collect()
    }

    pub fn is_finished(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .history
            .back()
            .is_some_and(|s| matches!(s.msg, LogMsg::Finished))
    }

    /// History followed by live messages. The stream ends after `Finished`.
    pub fn history_plus_stream(&self) -> BoxStream<'static, Result<LogMsg, io::Error>> {
        let (history, receiver) = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            let history: Vec<LogMsg> = inner.history.iter().map(|s| s.msg.clone()).collect();
            (history, self.sender.subscribe())
        };

        // lagged receivers drop the skipped messages rather than failing the stream
        let live = BroadcastStream::new(receiver)
            .filter_map(|res| async move { res.ok().map(Ok::<LogMsg, io::Error>) });

        let combined = futures::stream::iter(history.into_iter().map(Ok::<LogMsg, io::Error>))
            .chain(live)
            .boxed();

        // stop right after Finished without waiting on the channel again
        futures::stream::unfold((combined, false), |(mut stream, done)| async move {
            if done {
                return None;
            }
            let item = stream.next().await?;
            let done = matches!(item, Ok(LogMsg::Finished));
            Some((item, (stream, done)))
        })
        .boxed()
    }

    /// Raw stdout chunks as they were read from the pipe (not split into lines).
    pub fn stdout_chunked_stream(&self) -> BoxStream<'static, Result<String, io::Error>> {
        self.history_plus_stream()
            .filter_map(|res| async move {
                match res {
                    Ok(LogMsg::Stdout(s)) => Some(Ok(s)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed()
    }

    /// Forward a process output stream into this store. Read errors are recorded as stderr.
    pub fn spawn_forwarder<S>(self: Arc<Self>, stream: S) -> JoinHandle<()>
    where
        S: Stream<Item = Result<LogMsg, io::Error>> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(next) = stream.next().await {
                match next {
                    Ok(msg) => self.push(msg),
                    Err(e) => self.push(LogMsg::Stderr(format!("stream error: {e}"))),
                }
            }
        })
    }
}
