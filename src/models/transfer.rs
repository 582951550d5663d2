//! Model file transfers — streaming download with progress and verification.
//!
//! Downloads stream into `<file>.partial` and are renamed into place once
//! complete. An interrupted body is picked up again with a `Range` header
//! within the same transfer; nothing is kept for a later attempt.

use crate::config::DownloadConfig;
use crate::error::TransferError;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Progress reports buffered between the fetcher and the catalog.
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_written: u64,
    pub bytes_expected: u64,
}

impl TransferProgress {
    /// Completed fraction in [0, 1]; 0 while the size is unknown.
    pub fn fraction(&self) -> f64 {
        if self.bytes_expected == 0 {
            return 0.0;
        }
        (self.bytes_written as f64 / self.bytes_expected as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub model_id: String,
    pub url: String,
    pub destination: PathBuf,
}

/// Resumable byte-range fetch of one URL into one file.
pub trait Fetcher: Send + Sync + 'static {
    /// Write the body of `request.url` to `request.destination`, sending
    /// progress as it goes. Returns the number of bytes written.
    fn fetch(
        &self,
        request: &TransferRequest,
        progress: mpsc::Sender<TransferProgress>,
    ) -> impl Future<Output = Result<u64, TransferError>> + Send;
}

/// One in-flight download. Consumed by [`Transfer::run`]; the progress
/// channel closes when the transfer reaches a terminal state.
pub struct Transfer {
    request: TransferRequest,
    progress: mpsc::Sender<TransferProgress>,
}

impl Transfer {
    pub fn new(request: TransferRequest) -> (Self, mpsc::Receiver<TransferProgress>) {
        let (progress, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        (Self { request, progress }, rx)
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub async fn run<F: Fetcher>(self, fetcher: &F) -> Result<PathBuf, TransferError> {
        let Transfer { request, progress } = self;
        let bytes = fetcher.fetch(&request, progress).await?;
        log::info!(
            "[DOWNLOAD] {} complete: {} bytes -> {}",
            request.model_id,
            bytes,
            request.destination.display()
        );
        Ok(request.destination)
    }
}

/// Path of the in-progress file for `destination`.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    destination.with_file_name(name)
}

/// HTTP(S) fetcher built on reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl HttpFetcher {
    pub fn new(config: DownloadConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Stream one response into `file`, starting at `*written`.
    async fn stream_once(
        &self,
        request: &TransferRequest,
        file: &mut std::fs::File,
        written: &mut u64,
        expected: &mut Option<u64>,
        progress: &mpsc::Sender<TransferProgress>,
    ) -> Result<(), TransferError> {
        let mut req = self.client.get(&request.url);
        if *written > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={}-", *written));
        }
        let mut resp = req.send().await?;
        let status = resp.status();

        if !status.is_success() {
            return Err(TransferError::Status(status.as_u16()));
        }
        if *written > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
            log::warn!(
                "[DOWNLOAD] {}: server ignored range request, restarting",
                request.model_id
            );
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            *written = 0;
            *expected = None;
        }
        if expected.is_none() {
            *expected = resp.content_length().map(|len| len + *written);
        }

        let total = expected.unwrap_or(0);
        let mut last_report = *written;
        let _ = progress
            .send(TransferProgress {
                bytes_written: *written,
                bytes_expected: total,
            })
            .await;

        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk)?;
            *written += chunk.len() as u64;

            if *written - last_report >= self.config.progress_interval_bytes
                || (total > 0 && *written >= total)
            {
                last_report = *written;
                let _ = progress
                    .send(TransferProgress {
                        bytes_written: *written,
                        bytes_expected: total,
                    })
                    .await;
            }
        }

        if total > 0 && *written < total {
            return Err(TransferError::Interrupted {
                written: *written,
                expected: total,
            });
        }
        Ok(())
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: &TransferRequest,
        progress: mpsc::Sender<TransferProgress>,
    ) -> Result<u64, TransferError> {
        let partial = partial_path(&request.destination);
        let mut file = std::fs::File::create(&partial)?;
        let mut written = 0u64;
        let mut expected = None;
        let mut attempt = 0u32;

        log::info!(
            "[DOWNLOAD] Fetching {} from {}",
            request.model_id,
            request.url
        );

        loop {
            match self
                .stream_once(request, &mut file, &mut written, &mut expected, &progress)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_resumable() && attempt < self.config.max_resume_attempts => {
                    attempt += 1;
                    log::warn!(
                        "[DOWNLOAD] {} interrupted at {} bytes ({}), resuming (attempt {}/{})",
                        request.model_id,
                        written,
                        e,
                        attempt,
                        self.config.max_resume_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        }

        file.flush()?;
        drop(file);

        // Unknown length: report completion explicitly.
        if expected.is_none() {
            let _ = progress
                .send(TransferProgress {
                    bytes_written: written,
                    bytes_expected: written,
                })
                .await;
        }

        std::fs::rename(&partial, &request.destination)?;
        Ok(written)
    }
}

/// Verify a file's SHA-256.
///
/// Reads in 8 MB chunks to avoid loading multi-GB models into memory.
pub fn verify_sha256(path: &Path, expected_hash: &str) -> Result<(), TransferError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(8 * 1024 * 1024, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 8 * 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let actual = format!("{:x}", hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected_hash) {
        return Err(TransferError::IntegrityMismatch {
            expected: expected_hash.to_string(),
            actual,
        });
    }
    Ok(())
}
