//! Locating agent binaries on `PATH`

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    time::Duration,
};

const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve an executable by name.
///
/// Explicit paths are taken as-is when they point at a file. Bare names go through `which`,
/// and on a miss the PATH of the user's login shell is merged into the process PATH and the
/// lookup is retried once (agents are often installed by shell-profile tooling such as nvm).
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which(executable).await {
        return Some(found);
    }

    if refresh_path().await
        && let Some(found) = which(executable).await
    {
        return Some(found);
    }

    None
}

/// Merge two PATH strings, keeping `primary` order and appending unseen `secondary` entries.
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn which(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(|result| result.ok())
}

async fn refresh_path() -> bool {
    let Some(login_path) = login_shell_path().await else {
        return false;
    };
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let merged = merge_paths(&existing, OsString::from(&login_path));
    if merged == existing {
        return false;
    }
    tracing::debug!(?existing, ?merged, "Refreshed PATH from login shell");
    unsafe {
        std::env::set_var("PATH", &merged);
    }
    true
}

#[cfg(unix)]
async fn login_shell_path() -> Option<String> {
    use std::process::Stdio;

    use tokio::process::Command;

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let mut cmd = Command::new(&shell);
    cmd.arg("-l")
        .arg("-c")
        .arg("printf '%s' \"$PATH\"")
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(_) => return None,
        Err(_) => {
            tracing::warn!(%shell, "Timed out reading PATH from login shell");
            return None;
        }
    };

    let path = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if path.is_empty() { None } else { Some(path) }
}

#[cfg(not(unix))]
async fn login_shell_path() -> Option<String> {
    let _ = PATH_REFRESH_TIMEOUT;
    None
}
