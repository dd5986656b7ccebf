//! Request path → repository identity resolution.
//!
//! The proxy accepts exactly two smart-HTTP shapes:
//!
//! - `GET  /<repo>[.git]/info/refs?service=git-upload-pack` ([`Phase::Advertise`])
//! - `POST /<repo>[.git]/git-upload-pack`                   ([`Phase::Negotiate`])
//!
//! `<repo>` is the upstream location without scheme, e.g.
//! `github.com/org/project`.  Because the identity is later joined onto the
//! cache root, it is validated here against path traversal before anything
//! else sees it.  Resolution is pure: no I/O, no logging.

use std::fmt;

use axum::http::{Method, Uri};
use thiserror::Error;

const INFO_REFS_SUFFIX: &str = "/info/refs";
const UPLOAD_PACK_SUFFIX: &str = "/git-upload-pack";
/// Service name of the only protocol the proxy serves.
pub const UPLOAD_PACK_SERVICE: &str = "git-upload-pack";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Canonical, filesystem-safe key for one upstream repository.
///
/// Always non-empty, `/`-separated, without empty, `.` or `..` segments and
/// without a trailing `.git`.  The first segment (the upstream host) is
/// lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryIdentity(String);

impl RepositoryIdentity {
    /// Validate and normalise a raw repository string taken from a request path.
    pub fn parse(raw: &str) -> Result<Self, Rejection> {
        let trimmed = raw.strip_suffix(".git").unwrap_or(raw);

        if trimmed.is_empty() {
            return Err(Rejection::NotFound);
        }
        if trimmed.starts_with('/') {
            return Err(Rejection::InvalidPath);
        }
        if trimmed
            .chars()
            .any(|c| c == '\0' || c == '\\' || c == '%' || c.is_control())
        {
            return Err(Rejection::InvalidPath);
        }

        let segments: Vec<&str> = trimmed.split('/').collect();
        for segment in &segments {
            if segment.is_empty() || *segment == "." || *segment == ".." {
                return Err(Rejection::InvalidPath);
            }
            // Mirrors live at `<identity>.git`; an inner `.git` segment would
            // nest one identity's storage inside another's.
            if segment.ends_with(".git") {
                return Err(Rejection::InvalidPath);
            }
        }

        let mut normalized = segments[0].to_ascii_lowercase();
        for segment in &segments[1..] {
            normalized.push('/');
            normalized.push_str(segment);
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segments of the identity, suitable for joining onto a directory.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for RepositoryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which half of the stateless smart-HTTP exchange a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `info/refs` ref advertisement.
    Advertise,
    /// `git-upload-pack` pack negotiation.
    Negotiate,
}

impl Phase {
    /// Response `Content-Type` for this phase.
    pub fn content_type(self) -> &'static str {
        match self {
            Phase::Advertise => "application/x-git-upload-pack-advertisement",
            Phase::Negotiate => "application/x-git-upload-pack-result",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Advertise => "advertise",
            Phase::Negotiate => "negotiate",
        }
    }
}

/// Reasons a request path is refused before any cache work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("repository path is not allowed")]
    InvalidPath,
    #[error("HTTP method does not match the requested protocol phase")]
    MethodMismatch,
    #[error("not a git-upload-pack endpoint")]
    NotFound,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Map an inbound request to the repository it targets and its protocol phase.
pub fn resolve(uri: &Uri, method: &Method) -> Result<(RepositoryIdentity, Phase), Rejection> {
    let path = uri.path();
    let Some(rest) = path.strip_prefix('/') else {
        return Err(Rejection::NotFound);
    };

    let (repo, phase) = if let Some(repo) = rest.strip_suffix(UPLOAD_PACK_SUFFIX) {
        (repo, Phase::Negotiate)
    } else if let Some(repo) = rest.strip_suffix(INFO_REFS_SUFFIX) {
        if !requests_upload_pack(uri.query()) {
            return Err(Rejection::NotFound);
        }
        (repo, Phase::Advertise)
    } else {
        return Err(Rejection::NotFound);
    };

    let identity = RepositoryIdentity::parse(repo)?;

    let expected = match phase {
        Phase::Advertise => Method::GET,
        Phase::Negotiate => Method::POST,
    };
    if *method != expected {
        return Err(Rejection::MethodMismatch);
    }

    Ok((identity, phase))
}

/// True when the query string selects the `git-upload-pack` service.
fn requests_upload_pack(query: Option<&str>) -> bool {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == "service" && value == UPLOAD_PACK_SERVICE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
