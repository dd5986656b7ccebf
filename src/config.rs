use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Proxy configuration, loaded from YAML.  Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub upload_pack: UploadPackConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    pub http_listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding mirrors, staging clones and quarantine.
    pub cache_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/cache/git"),
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

/// How a repository identity is turned into an upstream URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Https,
    Http,
}

impl UpstreamScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Https => "https",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub scheme: UpstreamScheme,
}

// ---------------------------------------------------------------------------
// Cache policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum age (seconds) of a mirror before a request triggers a fetch.
    /// `0` disables staleness-based refresh entirely.
    pub max_staleness: u64,
    /// Fetch from upstream on every advertisement request, regardless of age.
    pub force_refresh_on_every_request: bool,
    /// Upper bound (seconds) on a single clone or fetch.
    pub sync_timeout: u64,
}

impl CacheConfig {
    pub fn max_staleness(&self) -> Duration {
        Duration::from_secs(self.max_staleness)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_staleness: 60,
            force_refresh_on_every_request: false,
            sync_timeout: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// Upload-pack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadPackConfig {
    /// Executable implementing the pack protocol.
    pub program: String,
    /// Passed as `--timeout=<n>`; `0` omits the flag.
    pub timeout: u64,
    /// Pass `--strict` so only the exact mirror directory is served.
    pub strict: bool,
    /// Cap (bytes) on a gzip-encoded negotiation body, which must be buffered
    /// to be decoded.
    pub max_request_body: usize,
}

impl Default for UploadPackConfig {
    fn default() -> Self {
        Self {
            program: "git-upload-pack".to_string(),
            timeout: 60,
            strict: true,
            max_request_body: 64 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.  Empty text yields defaults.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    config
        .proxy
        .http_listen
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid http_listen address: {}", config.proxy.http_listen))?;
    anyhow::ensure!(
        config.cache.sync_timeout > 0,
        "cache.sync_timeout must be greater than zero"
    );
    anyhow::ensure!(
        !config.upload_pack.program.trim().is_empty(),
        "upload_pack.program must not be empty"
    );
    anyhow::ensure!(
        !config.storage.cache_root.as_os_str().is_empty(),
        "storage.cache_root must not be empty"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
