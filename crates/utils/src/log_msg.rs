use json_patch::Patch;
use serde::{Deserialize, Serialize};

pub const EV_STDOUT: &str = "stdout";
pub const EV_STDERR: &str = "stderr";
pub const EV_JSON_PATCH: &str = "json_patch";
pub const EV_SESSION_ID: &str = "session_id";
pub const EV_FINISHED: &str = "finished";

/// One item on an execution's or session's outbound channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum LogMsg {
    Stdout(String),
    Stderr(String),
    JsonPatch(Patch),
    SessionId(String),
    Finished,
}

impl LogMsg {
    pub fn name(&self) -> &'static str {
        match self {
            LogMsg::Stdout(_) => EV_STDOUT,
            LogMsg::Stderr(_) => EV_STDERR,
            LogMsg::JsonPatch(_) => EV_JSON_PATCH,
            LogMsg::SessionId(_) => EV_SESSION_ID,
            LogMsg::Finished => EV_FINISHED,
        }
    }

    /// Rough size accounting for the byte-budgeted history in `MsgStore`.
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 8;
        let payload = match self {
            LogMsg::Stdout(s) | LogMsg::Stderr(s) | LogMsg::SessionId(s) => s.len(),
            LogMsg::JsonPatch(patch) => serde_json::to_string(patch).map(|s| s.len()).unwrap_or(2),
            LogMsg::Finished => 0,
        };
        self.name().len() + payload + OVERHEAD
    }
}
