//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the system `git` binary.  The
//! child is spawned with `kill_on_drop`, so a caller that stops waiting (a
//! timeout firing, a task being aborted) also terminates the process instead
//! of leaving it to run unattended.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Failure of a single git invocation.
#[derive(Debug, Error)]
pub enum GitCommandError {
    #[error("failed to spawn git: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("git did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("git exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// Summary of a `git fetch` operation.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Number of refs that were updated (new, changed or pruned).
    pub refs_updated: usize,
}

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Run `git clone --mirror <url> <dest>`.
///
/// `dest` must not exist yet.  On any error the directory may hold a partial
/// clone; callers clone into a staging location and publish on success.
#[instrument(fields(%url, dest = %dest.display()))]
pub async fn git_clone_mirror(
    url: &str,
    dest: &Path,
    timeout: Duration,
) -> Result<(), GitCommandError> {
    let mut cmd = Command::new("git");
    cmd.arg("clone")
        .arg("--mirror")
        .arg("--quiet")
        .arg("--")
        .arg(url)
        .arg(dest);

    debug!("spawning git clone --mirror");
    run(cmd, timeout).await?;
    debug!("git clone --mirror succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Run `git fetch --prune --force origin` inside an existing mirror.
///
/// The mirror's `origin` remote was configured by `git clone --mirror` with
/// the `+refs/*:refs/*` refspec, so this brings every ref up to date.  Git
/// updates each ref atomically after the objects it points to are stored; a
/// failed or interrupted fetch leaves the previous refs in place.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_fetch_mirror(
    repo_path: &Path,
    timeout: Duration,
) -> Result<FetchResult, GitCommandError> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_path)
        .arg("fetch")
        .arg("--prune")
        .arg("--force")
        .arg("origin");

    debug!("spawning git fetch");
    let stderr = run(cmd, timeout).await?;
    let refs_updated = count_updated_refs(&stderr);
    debug!(refs_updated, "git fetch complete");

    Ok(FetchResult { refs_updated })
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Run `git fsck --connectivity-only` inside a mirror.
///
/// Succeeds when every ref reaches a complete object graph.  Blob contents
/// are not checked, which keeps this fast enough for the failure path.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn git_verify_mirror(repo_path: &Path, timeout: Duration) -> Result<(), GitCommandError> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo_path)
        .arg("fsck")
        .arg("--connectivity-only")
        .arg("--no-dangling")
        .arg("--no-progress");

    run(cmd, timeout).await?;
    debug!("mirror is connected");
    Ok(())
}

/// Count the number of ref-update lines in `git fetch` stderr.
///
/// Lines like ` + 1a2b3c...4d5e6f main -> main` or ` - [deleted] (none) -> x`
/// are counted.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `cmd` to completion within `timeout`, returning its stderr on success.
async fn run(mut cmd: Command, timeout: Duration) -> Result<String, GitCommandError> {
    cmd.env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(GitCommandError::Spawn)?,
        Err(_) => return Err(GitCommandError::TimedOut(timeout)),
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        return Err(GitCommandError::Failed {
            status: output.status,
            stderr,
        });
    }

    Ok(stderr)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
