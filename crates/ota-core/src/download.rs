//! Resumable artifact downloader.
//!
//! Streams the artifact to disk in bounded chunks, feeding the checksum
//! accumulator as it goes so no second pass over the file is needed. Partial
//! transfers resume with an HTTP `Range` request after re-hashing the bytes
//! already on disk; a server that refuses the range gets a full restart.
//!
//! After the stream ends three checks run in order:
//! 1. bytes received equal the transport `Content-Length` (when sent)
//! 2. bytes on disk equal the size declared in the update command
//! 3. the SHA-256 digest equals the expected checksum
//!
//! Any mismatch deletes the file. Transport failures keep the partial file
//! and are retried with exponential backoff.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

use crate::checksum::{ChecksumVerifier, Sha256Digest, StreamingHasher};
use crate::error::OtaError;
use crate::shutdown::ShutdownSignal;
use crate::state::percent;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for the next chunk.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Persist progress at least every this many bytes.
const DEFAULT_CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;

/// Persist progress at least every this many percent.
const DEFAULT_CHECKPOINT_PERCENT: u8 = 5;

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub connect_timeout: Duration,
    /// Maximum silence between two chunks.
    pub read_timeout: Duration,
    /// In-process retries of transport failures.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub checkpoint: CheckpointPolicy,
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
            checkpoint: CheckpointPolicy::default(),
            user_agent: format!("ota-core/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Cadence at which the persisted byte count is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub percent_step: u8,
    pub byte_step: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            percent_step: DEFAULT_CHECKPOINT_PERCENT,
            byte_step: DEFAULT_CHECKPOINT_BYTES,
        }
    }
}

impl CheckpointPolicy {
    /// Whether moving from `last` to `now` bytes crosses a checkpoint.
    pub fn due(&self, last: u64, now: u64, total: u64) -> bool {
        if now <= last {
            return false;
        }
        if self.byte_step > 0 && now - last >= self.byte_step {
            return true;
        }
        if self.percent_step > 0 && total > 0 {
            let step = self.percent_step;
            return percent(now, total) / step > percent(last, total) / step;
        }
        false
    }
}

/// One fetch: where from, where to, and what the result must look like.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub declared_size: u64,
    pub expected_checksum: Sha256Digest,
    /// Bytes already on disk according to the persisted record.
    pub resume_from: u64,
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes_written: u64,
    pub checksum: Sha256Digest,
    /// Offset the final attempt started from (0 for a full transfer).
    pub resumed_from: u64,
}

/// Receives progress from a running fetch.
#[async_trait]
pub trait FetchObserver: Send + Sync {
    /// Called for every chunk. Must not block.
    fn on_progress(&self, _progress: DownloadProgress) {}

    /// Persist `bytes_on_disk`. Called only after those bytes are flushed.
    async fn on_checkpoint(&self, bytes_on_disk: u64) -> Result<(), OtaError>;

    /// The body has been fully received; validation starts.
    async fn on_stream_complete(&self, _bytes: u64) {}
}

/// Secure artifact downloader with resume support.
pub struct Downloader {
    client: reqwest::Client,
    config: DownloaderConfig,
    verifier: ChecksumVerifier,
}

impl Downloader {
    /// Create a downloader with default settings.
    pub fn new() -> Result<Self, OtaError> {
        Self::with_config(DownloaderConfig::default())
    }

    /// Create a downloader with custom configuration.
    pub fn with_config(config: DownloaderConfig) -> Result<Self, OtaError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| OtaError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            verifier: ChecksumVerifier::new(),
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Download `req.url` to `req.dest`, resuming from `req.resume_from`.
    ///
    /// Transport failures are retried up to `max_retries` times, each retry
    /// resuming from the bytes safely on disk. A shutdown between chunks
    /// returns [`OtaError::Interrupted`] after a final checkpoint.
    ///
    /// # Errors
    ///
    /// - transport errors once retries are exhausted; the partial file stays
    /// - [`OtaError::ContentLengthMismatch`], [`OtaError::SizeMismatch`] or
    ///   [`OtaError::ChecksumMismatch`]; the file is deleted
    pub async fn fetch(
        &self,
        req: &FetchRequest<'_>,
        observer: &dyn FetchObserver,
        shutdown: &ShutdownSignal,
    ) -> Result<FetchOutcome, OtaError> {
        info!(
            "Starting download: {} -> {:?} (resume from {})",
            req.url, req.dest, req.resume_from
        );

        let mut resume_from = req.resume_from;
        let mut attempt = 0;
        loop {
            match self.fetch_once(req, resume_from, observer, shutdown).await {
                Ok(outcome) => {
                    info!(
                        "Download complete: {} bytes, sha256 {}",
                        outcome.bytes_written,
                        hex::encode(outcome.checksum)
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    resume_from = on_disk_len(req.dest).await.min(req.declared_size);
                    let delay = backoff_delay(
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                        attempt,
                    );
                    warn!(
                        "Download attempt {} failed: {}; retrying from byte {} in {:?}",
                        attempt, e, resume_from, delay
                    );
                    let mut signal = shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signal.triggered() => return Err(OtaError::Interrupted),
                    }
                }
                Err(e) => {
                    if !e.preserves_progress() {
                        remove_partial(req.dest).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        req: &FetchRequest<'_>,
        resume_from: u64,
        observer: &dyn FetchObserver,
        shutdown: &ShutdownSignal,
    ) -> Result<FetchOutcome, OtaError> {
        if let Some(parent) = req.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut start = self.resume_offset(req, resume_from).await;
        let mut hasher = if start > 0 {
            self.verifier.hash_prefix(req.dest, start).await?
        } else {
            StreamingHasher::new()
        };

        if start > 0 && start == req.declared_size {
            info!("Artifact already fully on disk ({} bytes)", start);
            observer.on_stream_complete(start).await;
            return self.validate(req, None, 0, start, hasher, start);
        }

        let mut response = self.request(req.url, start).await?;
        if start > 0 {
            let status = response.status();
            let accepted = status == StatusCode::PARTIAL_CONTENT
                && content_range_start(&response) == Some(start);
            if !accepted {
                warn!(
                    "Server rejected resume from byte {} (status {}), restarting from zero",
                    start, status
                );
                if status != StatusCode::OK {
                    response = self.request(req.url, 0).await?;
                }
                start = 0;
                hasher = StreamingHasher::new();
            }
        }

        let status = response.status();
        let expected_status = if start > 0 {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        if status != expected_status {
            return Err(OtaError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let transport_len = response.content_length();
        let mut file = open_for_write(req.dest, start).await?;
        let mut stream = response.bytes_stream();
        let mut signal = shutdown.clone();
        let mut received: u64 = 0;
        let mut on_disk = start;
        let mut last_checkpoint = start;

        observer.on_progress(DownloadProgress::new(on_disk, req.declared_size));

        loop {
            let next = tokio::select! {
                biased;
                _ = signal.triggered() => {
                    checkpoint(&mut file, observer, on_disk).await?;
                    info!("Download interrupted at byte {}", on_disk);
                    return Err(OtaError::Interrupted);
                }
                next = tokio::time::timeout(self.config.read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    checkpoint(&mut file, observer, on_disk).await?;
                    return Err(OtaError::Network(e.to_string()));
                }
                Err(_) => {
                    checkpoint(&mut file, observer, on_disk).await?;
                    return Err(OtaError::Timeout {
                        url: req.url.to_string(),
                    });
                }
            };

            let after = on_disk + chunk.len() as u64;
            if after > req.declared_size {
                warn!(
                    "Server sent more than the declared {} bytes, aborting",
                    req.declared_size
                );
                return Err(OtaError::SizeMismatch {
                    expected: req.declared_size,
                    actual: after,
                });
            }

            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            received += chunk.len() as u64;
            on_disk = after;

            observer.on_progress(DownloadProgress::new(on_disk, req.declared_size));
            if self
                .config
                .checkpoint
                .due(last_checkpoint, on_disk, req.declared_size)
            {
                checkpoint(&mut file, observer, on_disk).await?;
                last_checkpoint = on_disk;
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        observer.on_checkpoint(on_disk).await?;
        observer.on_stream_complete(on_disk).await;

        self.validate(req, transport_len, received, on_disk, hasher, start)
    }

    /// Run the three post-stream checks.
    fn validate(
        &self,
        req: &FetchRequest<'_>,
        transport_len: Option<u64>,
        received: u64,
        on_disk: u64,
        hasher: StreamingHasher,
        resumed_from: u64,
    ) -> Result<FetchOutcome, OtaError> {
        if let Some(declared) = transport_len {
            if declared != received {
                warn!(
                    "Transport length mismatch: declared {}, received {}",
                    declared, received
                );
                return Err(OtaError::ContentLengthMismatch { declared, received });
            }
        }

        if on_disk != req.declared_size {
            warn!(
                "Download size mismatch: expected {}, got {}",
                req.declared_size, on_disk
            );
            return Err(OtaError::SizeMismatch {
                expected: req.declared_size,
                actual: on_disk,
            });
        }

        let checksum = hasher.finalize();
        self.verifier.check(&req.expected_checksum, &checksum)?;

        Ok(FetchOutcome {
            bytes_written: on_disk,
            checksum,
            resumed_from,
        })
    }

    /// Decide where the next attempt starts, given what is on disk.
    async fn resume_offset(&self, req: &FetchRequest<'_>, resume_from: u64) -> u64 {
        if resume_from == 0 {
            return 0;
        }
        if resume_from > req.declared_size {
            warn!(
                "Recorded progress {} exceeds declared size {}, restarting",
                resume_from, req.declared_size
            );
            return 0;
        }
        match tokio::fs::metadata(req.dest).await {
            Ok(meta) if meta.len() >= resume_from => resume_from,
            Ok(meta) => {
                warn!(
                    "Partial file has {} bytes but {} were recorded, resuming from {}",
                    meta.len(),
                    resume_from,
                    meta.len()
                );
                meta.len()
            }
            Err(_) => {
                debug!("No partial file at {:?}, starting from zero", req.dest);
                0
            }
        }
    }

    async fn request(&self, url: &str, start: u64) -> Result<Response, OtaError> {
        let mut request = self.client.get(url);
        if start > 0 {
            request = request.header(RANGE, format!("bytes={}-", start));
        }
        Ok(request.send().await?)
    }
}

/// Flush, fsync and persist the byte count.
async fn checkpoint(file: &mut File, observer: &dyn FetchObserver, bytes: u64) -> Result<(), OtaError> {
    file.flush().await?;
    file.sync_data().await?;
    observer.on_checkpoint(bytes).await
}

/// Open the destination, truncated to `start` bytes and positioned at its end.
async fn open_for_write(dest: &Path, start: u64) -> Result<File, OtaError> {
    if start == 0 {
        return Ok(File::create(dest).await?);
    }
    let mut file = OpenOptions::new().write(true).open(dest).await?;
    file.set_len(start).await?;
    file.seek(SeekFrom::End(0)).await?;
    Ok(file)
}

async fn on_disk_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed rejected download {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove rejected download {:?}: {}", path, e),
    }
}

/// Start offset from a `Content-Range: bytes <start>-<end>/<total>` header.
fn content_range_start(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_start(value)
}

fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Exponential backoff with +/-25% jitter.
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = base.saturating_mul(factor).min(max);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(jitter)
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes on disk so far.
    pub downloaded: u64,
    /// Total bytes to download.
    pub total: u64,
}

impl DownloadProgress {
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded, total }
    }

    /// Whole-number percentage, 0 to 100.
    pub fn percent(&self) -> u8 {
        percent(self.downloaded, self.total)
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total && self.total > 0
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.downloaded)
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} bytes ({}%)",
            self.downloaded,
            self.total,
            self.percent()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_policy_percent_steps() {
        let policy = CheckpointPolicy {
            percent_step: 5,
            byte_step: 0,
        };
        assert!(!policy.due(0, 4, 100));
        assert!(policy.due(0, 5, 100));
        assert!(!policy.due(5, 9, 100));
        assert!(policy.due(9, 10, 100));
        assert!(!policy.due(10, 10, 100));
    }

    #[test]
    fn test_checkpoint_policy_byte_steps() {
        let policy = CheckpointPolicy {
            percent_step: 0,
            byte_step: 1024,
        };
        assert!(!policy.due(0, 1023, 1 << 30));
        assert!(policy.due(0, 1024, 1 << 30));
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range_start("bytes 40-99/100"), Some(40));
        assert_eq!(parse_content_range_start("bytes 0-0/1"), Some(0));
        assert_eq!(parse_content_range_start("bytes */100"), None);
        assert_eq!(parse_content_range_start("items 1-2/3"), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        let first = backoff_delay(base, max, 1);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        let capped = backoff_delay(base, max, 10);
        assert!(capped <= Duration::from_millis(1250));
        assert!(capped >= Duration::from_millis(750));
    }

    #[test]
    fn test_download_progress() {
        let p = DownloadProgress::new(40, 100);
        assert_eq!(p.percent(), 40);
        assert_eq!(p.remaining(), 60);
        assert!(!p.is_complete());
        assert_eq!(p.to_string(), "40/100 bytes (40%)");
        assert!(DownloadProgress::new(100, 100).is_complete());
    }
}
