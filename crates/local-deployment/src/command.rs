use std::io;

use command_group::AsyncGroupChild;
#[cfg(unix)]
use nix::{
    sys::signal::{Signal, killpg},
    unistd::{Pid, getpgid},
};
use tokio::time::Duration;

/// Time each signal gets before the next, harsher one is sent.
pub const SIGNAL_GRACE: Duration = Duration::from_secs(2);

/// SIGINT, SIGTERM, then SIGKILL to the whole process group, waiting `grace` after each.
/// The child is reaped before returning.
pub async fn kill_process_group(child: &mut AsyncGroupChild, grace: Duration) -> io::Result<()> {
    // hit the whole process group, not just the leader
    #[cfg(unix)]
    {
        if let Some(pid) = child.inner().id() {
            let pgid = getpgid(Some(Pid::from_raw(pid as i32))).map_err(io::Error::other)?;

            for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL] {
                tracing::info!(pgid = %pgid, "Sending {sig:?} to process group");
                if let Err(e) = killpg(pgid, sig) {
                    tracing::warn!(pgid = %pgid, "Failed to send {sig:?}: {e}");
                }
                tokio::time::sleep(grace).await;
                if child.inner().try_wait()?.is_some() {
                    tracing::info!(pgid = %pgid, "Process group exited after {sig:?}");
                    break;
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill().await;
    let _ = child.wait().await;
    Ok(())
}
