//! On-disk mirror storage.
//!
//! Layout under the cache root:
//!
//! ```text
//! mirrors/<identity>.git                    published mirrors
//! mirrors/<identity>.git/gitcache-synced    mtime = last successful sync
//! staging/                                  clones in progress
//! quarantine/                               corrupt mirrors being removed
//! ```
//!
//! A mirror only ever appears under `mirrors/` by a rename from `staging/`
//! once the clone has completed, so `exists` never observes a partial clone.
//! Refreshes fetch in place; git updates refs only after the objects they
//! point to are written, so readers see either the old or the new state.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::git::commands::{self, GitCommandError};
use crate::identity::RepositoryIdentity;

const SYNC_STAMP: &str = "gitcache-synced";
const MIRRORS_DIR: &str = "mirrors";
const STAGING_DIR: &str = "staging";
const QUARANTINE_DIR: &str = "quarantine";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a mirror mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream rejected the request: {0}")]
    UpstreamRejected(String),
    #[error("disk full: {0}")]
    DiskFull(String),
    #[error("mirror is corrupt: {0}")]
    CorruptMirror(String),
}

impl StoreError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::DiskFull(_) => "disk_full",
            Self::CorruptMirror(_) => "corrupt_mirror",
        }
    }
}

impl From<GitCommandError> for StoreError {
    fn from(err: GitCommandError) -> Self {
        match err {
            GitCommandError::Spawn(e) => local_io_error("cannot run git", &e),
            GitCommandError::TimedOut(d) => {
                Self::UpstreamUnreachable(format!("no response within {}s", d.as_secs()))
            }
            GitCommandError::Failed { stderr, .. } => classify_git_stderr(&stderr),
        }
    }
}

/// Sort a failed git invocation into the store error taxonomy by its stderr.
///
/// Only git's own diagnostics are inspected: `remote:` lines come from the
/// origin, and quoted text holds URLs and paths that may contain any word.
/// Corruption markers only count on `fatal:` and `error:` lines.
pub(crate) fn classify_git_stderr(stderr: &str) -> StoreError {
    let detail = stderr.trim().to_string();
    let lines: Vec<String> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("remote:"))
        .map(|line| without_locations(line).to_ascii_lowercase())
        .collect();
    let any = |needles: &[&str]| {
        lines
            .iter()
            .any(|line| needles.iter().any(|n| line.contains(n)))
    };
    let corrupt = lines
        .iter()
        .filter(|line| line.starts_with("fatal:") || line.starts_with("error:"))
        .any(|line| CORRUPTION_MARKERS.iter().any(|m| line.contains(m)));

    if any(&["no space left on device", "disk quota exceeded"]) {
        StoreError::DiskFull(detail)
    } else if corrupt {
        StoreError::CorruptMirror(detail)
    } else if any(&[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "timed out",
        "network is unreachable",
        "failed to connect",
        "couldn't connect",
        "early eof",
        "remote end hung up unexpectedly",
        "ssl certificate problem",
        "ssl_connect",
        "ssl connect error",
        "gnutls",
        "tls handshake",
        "tls connection",
    ]) {
        StoreError::UpstreamUnreachable(detail)
    } else {
        StoreError::UpstreamRejected(detail)
    }
}

const CORRUPTION_MARKERS: &[&str] = &[
    "not a git repository",
    "corrupt",
    "bad object",
    "missing object",
    "loose object",
    "unable to read",
    "bad packed object",
];

/// Drop `'quoted'` segments and bare URLs from a diagnostic line.  A quote
/// only opens at the start of a word, so apostrophes ("couldn't") survive.
fn without_locations(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(start) = rest.find('\'') {
        let at_word_start = rest[..start]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        let closing = rest[start + 1..].find('\'');
        match closing {
            Some(len) if at_word_start => {
                out.push_str(&rest[..start]);
                rest = &rest[start + len + 2..];
            }
            _ => {
                out.push_str(&rest[..=start]);
                rest = &rest[start + 1..];
            }
        }
    }
    out.push_str(rest);

    out.split_whitespace()
        .filter(|word| !word.contains("://"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map a local filesystem error.  A full disk is reported as such; anything
/// else means the local copy cannot be trusted.
fn local_io_error(what: &str, err: &io::Error) -> StoreError {
    const EDQUOT: i32 = 122;
    if err.kind() == io::ErrorKind::StorageFull || err.raw_os_error() == Some(EDQUOT) {
        StoreError::DiskFull(format!("{what}: {err}"))
    } else {
        StoreError::CorruptMirror(format!("{what}: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Durable storage for repository mirrors.
///
/// Mutating operations must only be called while holding the identity's
/// lock.  `exists` and `freshness` may be called without it, but their answer
/// is then only a hint.
#[async_trait::async_trait]
pub trait MirrorStore: Send + Sync {
    /// Deterministic location of the mirror for `identity`.
    fn storage_path(&self, identity: &RepositoryIdentity) -> PathBuf;

    /// Whether a complete mirror is published for `identity`.
    async fn exists(&self, identity: &RepositoryIdentity) -> bool;

    /// Time since the last successful sync, or `None` if unknown.
    async fn freshness(&self, identity: &RepositoryIdentity) -> Option<Duration>;

    /// Clone `upstream_url` and publish it as the mirror for `identity`.
    async fn create_mirror(
        &self,
        identity: &RepositoryIdentity,
        upstream_url: &str,
    ) -> Result<(), StoreError>;

    /// Fetch into the existing mirror for `identity`.
    async fn refresh_mirror(&self, identity: &RepositoryIdentity) -> Result<(), StoreError>;

    /// Move a corrupt mirror out of the way and delete it, so the next
    /// request clones afresh.
    async fn quarantine(&self, identity: &RepositoryIdentity) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// GitMirrorStore
// ---------------------------------------------------------------------------

/// [`MirrorStore`] keeping `git clone --mirror` copies under a cache root.
#[derive(Debug, Clone)]
pub struct GitMirrorStore {
    root: PathBuf,
    sync_timeout: Duration,
}

impl GitMirrorStore {
    pub fn new(root: impl Into<PathBuf>, sync_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            sync_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mirrors_dir(&self) -> PathBuf {
        self.root.join(MIRRORS_DIR)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn quarantine_dir(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR)
    }

    /// Create the directory skeleton and discard clones and quarantined
    /// mirrors left behind by a previous process.
    pub async fn prepare_root(&self) -> io::Result<()> {
        for leftover in [self.staging_dir(), self.quarantine_dir()] {
            match tokio::fs::remove_dir_all(&leftover).await {
                Ok(()) => info!(path = %leftover.display(), "discarded leftovers from previous run"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        for dir in [self.mirrors_dir(), self.staging_dir(), self.quarantine_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// List the identities of every published mirror.
    pub fn list_mirrors(&self) -> io::Result<Vec<String>> {
        let base = self.mirrors_dir();
        let mut found = Vec::new();
        if !base.exists() {
            return Ok(found);
        }

        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let path = entry.path();
                let is_mirror = path.extension().is_some_and(|ext| ext == "git")
                    && path.join("HEAD").is_file();
                if !is_mirror {
                    stack.push(path);
                    continue;
                }
                if let Ok(rel) = path.with_extension("").strip_prefix(&base) {
                    let segments: Vec<_> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    found.push(segments.join("/"));
                }
            }
        }

        found.sort();
        Ok(found)
    }

    async fn mark_synced(&self, mirror: &Path) -> io::Result<()> {
        tokio::fs::write(mirror.join(SYNC_STAMP), b"").await
    }

    /// Keep a `CorruptMirror` verdict only if the mirror also fails a local
    /// connectivity check; otherwise the failure came from the upstream.
    async fn confirm_corruption(&self, mirror: &Path, err: StoreError) -> StoreError {
        let StoreError::CorruptMirror(detail) = err else {
            return err;
        };
        match commands::git_verify_mirror(mirror, self.sync_timeout).await {
            Err(GitCommandError::Failed { stderr, .. }) => {
                StoreError::CorruptMirror(format!("{detail}\n{stderr}"))
            }
            Ok(()) => {
                debug!(path = %mirror.display(), "mirror passed fsck, failure is upstream");
                StoreError::UpstreamRejected(detail)
            }
            Err(e) => {
                warn!(error = %e, path = %mirror.display(), "could not verify mirror");
                StoreError::UpstreamRejected(detail)
            }
        }
    }
}

#[async_trait::async_trait]
impl MirrorStore for GitMirrorStore {
    fn storage_path(&self, identity: &RepositoryIdentity) -> PathBuf {
        let mut path = self.mirrors_dir();
        let segments: Vec<&str> = identity.segments().collect();
        if let Some((last, parents)) = segments.split_last() {
            for segment in parents {
                path.push(segment);
            }
            path.push(format!("{last}.git"));
        }
        path
    }

    async fn exists(&self, identity: &RepositoryIdentity) -> bool {
        let path = self.storage_path(identity);
        let is_file = |p: PathBuf| async move {
            tokio::fs::metadata(p).await.map(|m| m.is_file()).unwrap_or(false)
        };
        let is_dir = |p: PathBuf| async move {
            tokio::fs::metadata(p).await.map(|m| m.is_dir()).unwrap_or(false)
        };
        is_file(path.join("HEAD")).await && is_dir(path.join("objects")).await
    }

    async fn freshness(&self, identity: &RepositoryIdentity) -> Option<Duration> {
        let stamp = self.storage_path(identity).join(SYNC_STAMP);
        let modified = tokio::fs::metadata(&stamp).await.ok()?.modified().ok()?;
        // A stamp from the future (clock step) counts as just synced.
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    #[instrument(skip(self), fields(%identity))]
    async fn create_mirror(
        &self,
        identity: &RepositoryIdentity,
        upstream_url: &str,
    ) -> Result<(), StoreError> {
        let dest = self.storage_path(identity);

        tokio::fs::create_dir_all(self.staging_dir())
            .await
            .map_err(|e| local_io_error("failed to create staging directory", &e))?;
        // Dropping the TempDir removes whatever a failed or interrupted clone
        // left behind.
        let staging = tempfile::Builder::new()
            .prefix("clone-")
            .tempdir_in(self.staging_dir())
            .map_err(|e| local_io_error("failed to create staging clone", &e))?;
        let staged = staging.path().join("mirror.git");

        commands::git_clone_mirror(upstream_url, &staged, self.sync_timeout).await?;
        self.mark_synced(&staged)
            .await
            .map_err(|e| local_io_error("failed to stamp new mirror", &e))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| local_io_error("failed to create mirror parent", &e))?;
        }
        // Only an incomplete directory can sit here: callers re-check `exists`
        // under the lock before cloning.
        if tokio::fs::metadata(&dest).await.is_ok() {
            warn!(path = %dest.display(), "replacing incomplete mirror directory");
            tokio::fs::remove_dir_all(&dest)
                .await
                .map_err(|e| local_io_error("failed to remove incomplete mirror", &e))?;
        }

        tokio::fs::rename(&staged, &dest)
            .await
            .map_err(|e| local_io_error("failed to publish mirror", &e))?;

        info!(path = %dest.display(), "mirror published");
        Ok(())
    }

    #[instrument(skip(self), fields(%identity))]
    async fn refresh_mirror(&self, identity: &RepositoryIdentity) -> Result<(), StoreError> {
        let path = self.storage_path(identity);
        if !self.exists(identity).await {
            return Err(StoreError::CorruptMirror(format!(
                "no mirror at {}",
                path.display()
            )));
        }

        let result = match commands::git_fetch_mirror(&path, self.sync_timeout).await {
            Ok(result) => result,
            Err(e) => return Err(self.confirm_corruption(&path, e.into()).await),
        };

        // The fetch itself succeeded; a missing stamp only costs an early
        // refresh next time.
        if let Err(e) = self.mark_synced(&path).await {
            warn!(error = %e, path = %path.display(), "failed to update sync stamp");
        }

        debug!(refs_updated = result.refs_updated, "mirror refreshed");
        Ok(())
    }

    #[instrument(skip(self), fields(%identity))]
    async fn quarantine(&self, identity: &RepositoryIdentity) -> Result<(), StoreError> {
        let path = self.storage_path(identity);
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(());
        }

        tokio::fs::create_dir_all(self.quarantine_dir())
            .await
            .map_err(|e| local_io_error("failed to create quarantine directory", &e))?;
        let holding = tempfile::Builder::new()
            .prefix("mirror-")
            .tempdir_in(self.quarantine_dir())
            .map_err(|e| local_io_error("failed to create quarantine slot", &e))?;

        tokio::fs::rename(&path, holding.path().join("mirror.git"))
            .await
            .map_err(|e| local_io_error("failed to quarantine mirror", &e))?;
        warn!(path = %path.display(), "corrupt mirror quarantined");

        // Deleting a large tree is slow; do it off the request path.
        tokio::task::spawn_blocking(move || {
            if let Err(e) = holding.close() {
                warn!(error = %e, "failed to delete quarantined mirror");
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RepositoryIdentity {
        RepositoryIdentity::parse(s).unwrap()
    }

    fn store(root: &Path) -> GitMirrorStore {
        GitMirrorStore::new(root, Duration::from_secs(60))
    }

    /// Lay out the minimum a published mirror looks like.
    fn fake_mirror(path: &Path) {
        std::fs::create_dir_all(path.join("objects")).unwrap();
        std::fs::create_dir_all(path.join("refs")).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn storage_path_is_derived_from_identity() {
        let store = store(Path::new("/var/cache/git"));
        assert_eq!(
            store.storage_path(&id("github.com/org/repo")),
            PathBuf::from("/var/cache/git/mirrors/github.com/org/repo.git")
        );
        assert_eq!(
            store.storage_path(&id("host")),
            PathBuf::from("/var/cache/git/mirrors/host.git")
        );
    }

    #[tokio::test]
    async fn exists_requires_head_and_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let repo = id("h/org/repo");
        let path = store.storage_path(&repo);

        assert!(!store.exists(&repo).await);

        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        assert!(!store.exists(&repo).await);

        fake_mirror(&path);
        assert!(store.exists(&repo).await);
    }

    #[tokio::test]
    async fn freshness_follows_sync_stamp() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let repo = id("h/org/repo");
        let path = store.storage_path(&repo);
        fake_mirror(&path);

        assert_eq!(store.freshness(&repo).await, None);

        store.mark_synced(&path).await.unwrap();
        let age = store.freshness(&repo).await.unwrap();
        assert!(age < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn failed_clone_leaves_nothing_visible() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let repo = id("h/org/missing");
        let upstream = tmp.path().join("no-such-upstream");

        let result = store
            .create_mirror(&repo, &upstream.to_string_lossy())
            .await;

        assert!(result.is_err());
        assert!(!store.exists(&repo).await);
        assert!(!store.storage_path(&repo).exists());
        let staged: Vec<_> = std::fs::read_dir(store.staging_dir()).unwrap().collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn refresh_without_mirror_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let result = store.refresh_mirror(&id("h/org/none")).await;
        assert!(matches!(result, Err(StoreError::CorruptMirror(_))));
    }

    #[tokio::test]
    async fn quarantine_removes_mirror() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let repo = id("h/org/repo");
        fake_mirror(&store.storage_path(&repo));
        assert!(store.exists(&repo).await);

        store.quarantine(&repo).await.unwrap();
        assert!(!store.exists(&repo).await);
        assert!(!store.storage_path(&repo).exists());

        // Quarantining again is a no-op.
        store.quarantine(&repo).await.unwrap();
    }

    #[tokio::test]
    async fn prepare_root_discards_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let leftover = store.staging_dir().join("clone-abc/mirror.git");
        std::fs::create_dir_all(&leftover).unwrap();
        let kept = store.storage_path(&id("h/kept"));
        fake_mirror(&kept);

        store.prepare_root().await.unwrap();

        assert!(!leftover.exists());
        assert!(store.staging_dir().is_dir());
        assert!(kept.join("HEAD").is_file());
    }

    #[test]
    fn list_mirrors_finds_nested_identities() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        fake_mirror(&store.storage_path(&id("github.com/org/a")));
        fake_mirror(&store.storage_path(&id("gitlab.com/group/sub/b")));
        std::fs::create_dir_all(store.mirrors_dir().join("github.com/org/incomplete.git"))
            .unwrap();

        assert_eq!(
            store.list_mirrors().unwrap(),
            vec!["github.com/org/a".to_string(), "gitlab.com/group/sub/b".to_string()]
        );
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_git_stderr("fatal: unable to access 'https://x/': Could not resolve host: x"),
            StoreError::UpstreamUnreachable(_)
        ));
        assert!(matches!(
            classify_git_stderr("remote: Repository not found.\nfatal: repository 'https://x/' not found"),
            StoreError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_git_stderr("fatal: Authentication failed for 'https://x/'"),
            StoreError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_git_stderr("error: file write error: No space left on device"),
            StoreError::DiskFull(_)
        ));
        assert!(matches!(
            classify_git_stderr("error: object file objects/ab/cd is empty\nfatal: loose object abcd is corrupt"),
            StoreError::CorruptMirror(_)
        ));
    }

    #[test]
    fn classification_ignores_urls_paths_and_remote_lines() {
        assert!(matches!(
            classify_git_stderr(
                "fatal: unable to access 'https://github.com/acme/corrupt-file-detector/': \
                 Could not resolve host: github.com"
            ),
            StoreError::UpstreamUnreachable(_)
        ));
        assert!(matches!(
            classify_git_stderr(
                "fatal: '/tmp/cache/corrupt-data-tools' does not appear to be a git repository\n\
                 fatal: Could not read from remote repository."
            ),
            StoreError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_git_stderr(
                "remote: error: bad object 1a2b3c\nremote: aborting due to possible repository corruption\n\
                 fatal: the remote end hung up unexpectedly"
            ),
            StoreError::UpstreamUnreachable(_)
        ));
        assert!(matches!(
            classify_git_stderr("fatal: repository 'https://example.com/org/openssl-tls.git/' not found"),
            StoreError::UpstreamRejected(_)
        ));
        assert!(matches!(
            classify_git_stderr(
                "fatal: unable to access 'https://x/': Failed to connect to x port 443: Couldn't connect to server"
            ),
            StoreError::UpstreamUnreachable(_)
        ));
    }

    #[test]
    fn locations_are_stripped_from_diagnostics() {
        assert_eq!(
            without_locations("fatal: repository 'https://h/corrupt/' not found"),
            "fatal: repository not found"
        );
        assert_eq!(
            without_locations("fatal: could not read from https://h/bad-object.git"),
            "fatal: could not read from"
        );
        assert_eq!(
            without_locations("error: Couldn't connect to server"),
            "error: Couldn't connect to server"
        );
        assert_eq!(without_locations("fatal: unmatched 'quote"), "fatal: unmatched 'quote");
    }

    #[test]
    fn timeout_maps_to_unreachable() {
        let err = StoreError::from(GitCommandError::TimedOut(Duration::from_secs(5)));
        assert!(matches!(err, StoreError::UpstreamUnreachable(_)));
        assert_eq!(err.kind(), "upstream_unreachable");
    }

    /// Create a repository with one commit at `path`.
    fn init_upstream(path: &Path) {
        std::fs::create_dir_all(path).unwrap();
        for args in [
            &["init", "--quiet"][..],
            &["commit", "--quiet", "--allow-empty", "-m", "initial"][..],
        ] {
            let status = std::process::Command::new("git")
                .arg("-C")
                .arg(path)
                .args(["-c", "user.name=gitcache", "-c", "user.email=gitcache@localhost"])
                .args(args)
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        }
    }

    #[tokio::test]
    async fn refresh_from_vanished_upstream_keeps_mirror() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let upstream = tmp.path().join("corrupt-data-tools");
        init_upstream(&upstream);

        let store = store(&tmp.path().join("cache"));
        store.prepare_root().await.unwrap();
        let repo = id("local/corrupt-data-tools");
        store
            .create_mirror(&repo, &upstream.to_string_lossy())
            .await
            .unwrap();

        std::fs::remove_dir_all(&upstream).unwrap();
        let err = store.refresh_mirror(&repo).await.unwrap_err();

        assert!(!matches!(err, StoreError::CorruptMirror(_)), "{err:?}");
        assert!(store.exists(&repo).await);
    }

    #[tokio::test]
    async fn damaged_mirror_fails_verification() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        init_upstream(&upstream);

        let store = store(&tmp.path().join("cache"));
        store.prepare_root().await.unwrap();
        let repo = id("local/upstream");
        store
            .create_mirror(&repo, &upstream.to_string_lossy())
            .await
            .unwrap();
        let path = store.storage_path(&repo);
        let timeout = Duration::from_secs(30);
        commands::git_verify_mirror(&path, timeout).await.unwrap();

        std::fs::remove_dir_all(path.join("objects")).unwrap();
        std::fs::create_dir_all(path.join("objects")).unwrap();

        let verified = commands::git_verify_mirror(&path, timeout).await;
        assert!(matches!(verified, Err(GitCommandError::Failed { .. })));
        let confirmed = store
            .confirm_corruption(&path, StoreError::CorruptMirror("fetch failed".into()))
            .await;
        assert!(matches!(confirmed, StoreError::CorruptMirror(_)));
    }

    #[tokio::test]
    async fn intact_mirror_is_not_confirmed_corrupt() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        init_upstream(&upstream);

        let store = store(&tmp.path().join("cache"));
        store.prepare_root().await.unwrap();
        let repo = id("local/upstream");
        store
            .create_mirror(&repo, &upstream.to_string_lossy())
            .await
            .unwrap();

        let err = StoreError::CorruptMirror("remote sent a bad object".into());
        let confirmed = store.confirm_corruption(&store.storage_path(&repo), err).await;
        assert_eq!(
            confirmed,
            StoreError::UpstreamRejected("remote sent a bad object".into())
        );
    }

    #[tokio::test]
    async fn timed_out_clone_is_unreachable_and_leaves_nothing() {
        if !git_available() {
            return;
        }
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let tmp = tempfile::tempdir().unwrap();
        let store = GitMirrorStore::new(tmp.path(), Duration::from_secs(1));
        store.prepare_root().await.unwrap();
        let repo = id("h/org/slow");

        let result = store
            .create_mirror(&repo, &format!("http://{addr}/org/slow.git"))
            .await;

        assert!(
            matches!(result, Err(StoreError::UpstreamUnreachable(_))),
            "{result:?}"
        );
        assert!(!store.exists(&repo).await);
        assert!(!store.storage_path(&repo).exists());
        assert_eq!(std::fs::read_dir(store.staging_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn clone_and_refresh_local_repository() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .arg("-C")
                .arg(&upstream)
                .args(["-c", "user.name=gitcache", "-c", "user.email=gitcache@localhost"])
                .args(args)
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        std::fs::create_dir_all(&upstream).unwrap();
        git(&["init", "--quiet"]);
        git(&["commit", "--quiet", "--allow-empty", "-m", "initial"]);

        let store = store(&tmp.path().join("cache"));
        store.prepare_root().await.unwrap();
        let repo = id("local/upstream");

        store
            .create_mirror(&repo, &upstream.to_string_lossy())
            .await
            .unwrap();
        assert!(store.exists(&repo).await);
        assert!(store.freshness(&repo).await.is_some());

        git(&["commit", "--quiet", "--allow-empty", "-m", "second"]);
        store.refresh_mirror(&repo).await.unwrap();
        assert_eq!(store.list_mirrors().unwrap(), vec!["local/upstream".to_string()]);
    }
}
