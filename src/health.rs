use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::cache::GitMirrorStore;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache_root: CheckResult,
    pub upload_pack: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub cache_root: PathBuf,
    pub upload_pack_program: PathBuf,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The cache root must accept new files; mirrors are counted for the detail.
async fn check_cache_root(root: &Path) -> CheckResult {
    let root = root.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        tempfile::NamedTempFile::new_in(root.join("staging"))?;
        let store = GitMirrorStore::new(&root, std::time::Duration::ZERO);
        Ok(store.list_mirrors()?.len())
    })
    .await;

    match result {
        Ok(Ok(mirrors)) => CheckResult::healthy(format!("{mirrors} mirrors")),
        Ok(Err(e)) => CheckResult::unhealthy(format!("cache root not writable: {e}")),
        Err(e) => CheckResult::unhealthy(format!("cache root check task failed: {e}")),
    }
}

fn check_upload_pack(program: &Path) -> CheckResult {
    match find_program(program) {
        Some(path) => CheckResult::healthy(path.display().to_string()),
        None => CheckResult::unhealthy(format!("{} not found", program.display())),
    }
}

/// Resolve `program` the way a process spawn would: as given when it has a
/// directory component, otherwise through `PATH`.  The execute bit is not
/// checked, so a non-executable match still reports healthy.
fn find_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.cache_root.ok {
        // Nothing can be served or cloned.
        HealthStatus::Unhealthy
    } else if !checks.upload_pack.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let checks = HealthChecks {
        cache_root: check_cache_root(&state.cache_root).await,
        upload_pack: check_upload_pack(&state.upload_pack_program),
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
