//! Protocol bridge between one HTTP exchange and one upload-pack process.
//!
//! The response body is fed from an mpsc channel by a driver task that owns
//! the process.  The driver writes the service header (advertise only),
//! pumps the request body into the process, forwards its stdout chunk by
//! chunk and logs its stderr.  When the client goes away the receiving end
//! of the channel is dropped; the driver notices, drops the process and
//! `kill_on_drop` terminates it.

use std::io::{self, Read as _};
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap};
use bytes::{Bytes, BytesMut};
use futures::StreamExt as _;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn, Instrument as _};

use crate::git::upload_pack::{BoxReader, BoxWriter, PackProcess, UploadPack};
use crate::identity::{Phase, RepositoryIdentity, UPLOAD_PACK_SERVICE};
use crate::metrics::{MetricsRegistry, PhaseLabels};

use super::pktline;

/// Response chunks buffered between the driver and the client.
const CHANNEL_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One accepted smart-HTTP request.
#[derive(Debug, Clone)]
pub struct ProxySession {
    pub identity: RepositoryIdentity,
    pub phase: Phase,
    /// Diagnostic client name from `Authorization: Basic`.
    pub user: Option<String>,
}

/// What gets written to the process's stdin.
#[derive(Debug)]
pub enum RequestInput {
    Empty,
    /// A body that was decoded up front.
    Buffered(Bytes),
    /// An identity-encoded body, forwarded as it arrives.
    Streaming(Body),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("upload-pack {phase} for {identity} failed: {detail}")]
    BackingProcessFailure {
        identity: RepositoryIdentity,
        phase: &'static str,
        detail: String,
    },
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("unsupported content encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("unreadable request body: {0}")]
    Unreadable(String),
}

// ---------------------------------------------------------------------------
// Request body
// ---------------------------------------------------------------------------

/// Prepare a negotiation body for the process.
///
/// Identity bodies are streamed.  Gzip bodies are buffered and decoded, with
/// both the compressed and the decoded size capped at `limit`.
pub async fn decode_request_body(
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> Result<RequestInput, BodyError> {
    let encoding = match headers.get(header::CONTENT_ENCODING) {
        None => return Ok(RequestInput::Streaming(body)),
        Some(value) => value
            .to_str()
            .map_err(|_| BodyError::UnsupportedEncoding(format!("{value:?}")))?
            .trim()
            .to_ascii_lowercase(),
    };

    match encoding.as_str() {
        "" | "identity" => Ok(RequestInput::Streaming(body)),
        "gzip" | "x-gzip" => {
            let compressed = collect_limited(body, limit).await?;
            let decoded = tokio::task::spawn_blocking(move || gunzip(&compressed, limit))
                .await
                .map_err(|e| BodyError::Unreadable(e.to_string()))??;
            Ok(RequestInput::Buffered(decoded))
        }
        _ => Err(BodyError::UnsupportedEncoding(encoding)),
    }
}

async fn collect_limited(body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BodyError::Unreadable(e.to_string()))?;
        if buf.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn gunzip(compressed: &[u8], limit: usize) -> Result<Bytes, BodyError> {
    let mut decoded = Vec::new();
    flate2::read::GzDecoder::new(compressed)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(|e| BodyError::Unreadable(e.to_string()))?;
    if decoded.len() > limit {
        return Err(BodyError::TooLarge { limit });
    }
    Ok(Bytes::from(decoded))
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

pub struct Bridge {
    upload_pack: Arc<dyn UploadPack>,
    metrics: MetricsRegistry,
}

impl Bridge {
    pub fn new(upload_pack: Arc<dyn UploadPack>, metrics: MetricsRegistry) -> Self {
        Self {
            upload_pack,
            metrics,
        }
    }

    /// Start upload-pack against `repo` and return the response body.
    ///
    /// Only a failure to start the process is reported here.  A non-zero
    /// exit later on ends the body with an error instead of a clean end of
    /// stream.
    pub async fn serve(
        &self,
        session: ProxySession,
        repo: &Path,
        input: RequestInput,
    ) -> Result<Body, BridgeError> {
        let labels = PhaseLabels::new(session.phase);
        debug!(user = ?session.user, repo = %repo.display(), "starting upload-pack");
        let process = match self.upload_pack.spawn(repo, session.phase).await {
            Ok(process) => process,
            Err(e) => {
                self.metrics
                    .metrics
                    .upload_pack_failures
                    .get_or_create(&labels)
                    .inc();
                return Err(BridgeError::BackingProcessFailure {
                    identity: session.identity,
                    phase: session.phase.as_str(),
                    detail: format!("{e:#}"),
                });
            }
        };

        let active = self
            .metrics
            .metrics
            .active_sessions
            .get_or_create(&labels)
            .clone();
        let failures = self
            .metrics
            .metrics
            .upload_pack_failures
            .get_or_create(&labels)
            .clone();

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let driver = Driver {
            _active: ActiveSession::start(active),
            session,
            tx,
            failures,
        };
        tokio::spawn(driver.run(process, input).in_current_span());

        Ok(Body::from_stream(ReceiverStream::new(rx)))
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type Chunk = io::Result<Bytes>;

/// Keeps the active-session gauge up for as long as the driver lives.
struct ActiveSession(Gauge);

impl ActiveSession {
    fn start(gauge: Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.dec();
    }
}

struct Driver {
    // Dropped before `tx`, so the gauge is down by the time the body ends.
    _active: ActiveSession,
    session: ProxySession,
    tx: mpsc::Sender<Chunk>,
    failures: Counter,
}

impl Driver {
    async fn run(self, process: PackProcess, input: RequestInput) {
        let PackProcess {
            stdin,
            stdout,
            stderr,
            exit,
        } = process;

        if self.session.phase == Phase::Advertise {
            let header = pktline::service_header(UPLOAD_PACK_SERVICE);
            if self.tx.send(Ok(header)).await.is_err() {
                info!("client disconnected before advertisement, terminating upload-pack");
                return;
            }
        }

        let identity = &self.session.identity;
        let exchange = async {
            let (fed, (), pumped) = tokio::join!(
                feed_stdin(stdin, input),
                log_stderr(stderr, identity),
                pump_stdout(stdout, &self.tx),
            );
            (fed, pumped, exit.await)
        };

        tokio::select! {
            biased;
            () = self.tx.closed() => {
                info!("client disconnected, terminating upload-pack");
            }
            (fed, pumped, status) = exchange => {
                if let Err(e) = fed {
                    debug!(error = %e, "upload-pack stopped reading its input");
                }
                self.finish(pumped, status).await;
            }
        }
    }

    async fn finish(&self, pumped: io::Result<u64>, status: io::Result<Option<i32>>) {
        let detail = match (&pumped, status) {
            (Ok(bytes), Ok(Some(0))) => {
                debug!(bytes, "upload-pack finished");
                return;
            }
            (Err(e), _) => format!("reading output failed: {e}"),
            (_, Ok(Some(code))) => format!("exited with status {code}"),
            (_, Ok(None)) => "terminated by signal".to_string(),
            (_, Err(e)) => format!("waiting for exit failed: {e}"),
        };

        self.failures.inc();
        let err = BridgeError::BackingProcessFailure {
            identity: self.session.identity.clone(),
            phase: self.session.phase.as_str(),
            detail,
        };
        warn!(error = %err, "truncating response");
        // Ending the body with an error aborts the chunked response instead
        // of terminating it cleanly.
        let _ = self.tx.send(Err(io::Error::other(err))).await;
    }
}

async fn feed_stdin(stdin: Option<BoxWriter>, input: RequestInput) -> io::Result<u64> {
    let Some(mut stdin) = stdin else {
        return Ok(0);
    };
    let written = match input {
        RequestInput::Empty => 0,
        RequestInput::Buffered(bytes) => {
            stdin.write_all(&bytes).await?;
            bytes.len() as u64
        }
        RequestInput::Streaming(body) => {
            let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
            let mut reader = std::pin::pin!(StreamReader::new(stream));
            tokio::io::copy(&mut reader, &mut stdin).await?
        }
    };
    stdin.shutdown().await?;
    Ok(written)
}

async fn pump_stdout(stdout: BoxReader, tx: &mpsc::Sender<Chunk>) -> io::Result<u64> {
    let mut chunks = ReaderStream::new(stdout);
    let mut total = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        total += chunk.len() as u64;
        if tx.send(Ok(chunk)).await.is_err() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"));
        }
    }
    Ok(total)
}

async fn log_stderr(stderr: Option<BoxReader>, identity: &RepositoryIdentity) {
    let Some(stderr) = stderr else {
        return;
    };
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(%identity, line, "upload-pack stderr");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
