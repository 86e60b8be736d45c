use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use json_patch::Patch;
use serde_json::to_value;
use workspace_utils::{log_msg::LogMsg, msg_store::MsgStore};

pub mod patch;

pub use patch::ConversationPatch;

/// Issues entry indices for one session stream.
///
/// Clones share the counter, so every producer appending to the same stream draws from one
/// sequence and an index is never handed out twice.
#[derive(Debug, Clone, Default)]
pub struct EntryIndexProvider(Arc<AtomicUsize>);

impl EntryIndexProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn starting_at(start: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(start)))
    }

    /// Return the current index and advance.
    pub fn next(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Resume after `history`: one past the highest index any `add` in it targeted, or 0.
    pub fn start_from(history: &[LogMsg]) -> Self {
        Self::start_from_patches(history.iter().filter_map(|msg| match msg {
            LogMsg::JsonPatch(patch) => Some(patch),
            _ => None,
        }))
    }

    pub fn start_from_patches<'a>(patches: impl IntoIterator<Item = &'a Patch>) -> Self {
        let next = patches
            .into_iter()
            .filter_map(max_added_index)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        Self::starting_at(next)
    }

    pub fn start_from_store(msg_store: &MsgStore) -> Self {
        Self::start_from(&msg_store.get_history())
    }
}

fn max_added_index(patch: &Patch) -> Option<usize> {
    let value = to_value(patch).ok()?;
    value
        .as_array()?
        .iter()
        .filter(|op| op.get("op").and_then(|o| o.as_str()) == Some("add"))
        .filter_map(|op| {
            op.get("path")?
                .as_str()?
                .strip_prefix("/entries/")?
                .parse::<usize>()
                .ok()
        })
        .max()
}
