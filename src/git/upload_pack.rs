//! The backing pack-protocol capability.
//!
//! The proxy never implements pack negotiation itself.  It hands the mirror
//! to an [`UploadPack`] implementation which produces a running
//! [`PackProcess`]: byte streams plus an exit future.  Production uses
//! [`GitUploadPack`], which runs `git-upload-pack --stateless-rpc`; tests
//! substitute in-memory fakes.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::UploadPackConfig;
use crate::identity::Phase;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A running backing process.
///
/// Dropping `exit` before it resolves must terminate the process; that is how
/// the bridge propagates a client disconnect.
pub struct PackProcess {
    /// Request input.  Present only in the negotiate phase.
    pub stdin: Option<BoxWriter>,
    pub stdout: BoxReader,
    /// Diagnostic output, forwarded to the log.
    pub stderr: Option<BoxReader>,
    /// Resolves to the exit code once the process ends (`None` if it was
    /// killed by a signal).
    pub exit: BoxFuture<'static, std::io::Result<Option<i32>>>,
}

/// Something that can serve the Git pack protocol for a local repository.
#[async_trait::async_trait]
pub trait UploadPack: Send + Sync {
    /// Start a process for `phase` against the repository at `repo`.
    async fn spawn(&self, repo: &Path, phase: Phase) -> Result<PackProcess>;
}

// ---------------------------------------------------------------------------
// git-upload-pack
// ---------------------------------------------------------------------------

/// [`UploadPack`] backed by the `git-upload-pack` executable.
#[derive(Debug, Clone)]
pub struct GitUploadPack {
    program: PathBuf,
    strict: bool,
    timeout_secs: u64,
}

impl GitUploadPack {
    pub fn new(config: &UploadPackConfig) -> Self {
        Self {
            program: PathBuf::from(&config.program),
            strict: config.strict,
            timeout_secs: config.timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, repo: &Path, phase: Phase) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--stateless-rpc");
        if phase == Phase::Advertise {
            cmd.arg("--advertise-refs");
        }
        if self.strict {
            cmd.arg("--strict");
        }
        if self.timeout_secs > 0 {
            cmd.arg(format!("--timeout={}", self.timeout_secs));
        }
        cmd.arg(repo);
        cmd
    }
}

#[async_trait::async_trait]
impl UploadPack for GitUploadPack {
    #[instrument(skip(self), fields(repo = %repo.display(), phase = phase.as_str()))]
    async fn spawn(&self, repo: &Path, phase: Phase) -> Result<PackProcess> {
        let mut cmd = self.command(repo, phase);
        cmd.stdin(match phase {
            Phase::Advertise => Stdio::null(),
            Phase::Negotiate => Stdio::piped(),
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        let stdin = child.stdin.take().map(|s| Box::pin(s) as BoxWriter);
        let stdout = child
            .stdout
            .take()
            .context("failed to capture upload-pack stdout")?;
        let stderr = child.stderr.take().map(|s| Box::pin(s) as BoxReader);

        debug!(pid = ?child.id(), "upload-pack started");

        // The child moves into the exit future; dropping the future drops the
        // child, and `kill_on_drop` terminates it.
        let exit = async move { child.wait().await.map(|status| status.code()) }.boxed();

        Ok(PackProcess {
            stdin,
            stdout: Box::pin(stdout),
            stderr,
            exit,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
