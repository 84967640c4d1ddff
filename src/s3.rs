//! The concrete object-store uploader: a single-attempt S3 `PUT` wrapped in
//! the app-level retry/backoff loop specified at `spec.md` §4.5. The AWS
//! SDK's own retry is disabled (`RetryConfig::disabled()`) so every
//! millisecond of latency here is accounted for by this loop, not a hidden
//! one underneath it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use ingest_common::{Counters, UploadError, Uploader};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Builds an S3 client with its own retry disabled, per `spec.md` §4.5.
pub async fn build_client(region: String) -> Client {
    let sdk_config = aws_config::from_env()
        .region(aws_config::Region::new(region))
        .retry_config(RetryConfig::disabled())
        .load()
        .await;
    Client::new(&sdk_config)
}

pub struct S3Uploader {
    client: Client,
    bucket: String,
    per_attempt_timeout: Duration,
    app_retries: u32,
    counters: Arc<Counters>,
}

impl S3Uploader {
    pub fn new(
        client: Client,
        bucket: String,
        per_attempt_timeout: Duration,
        app_retries: u32,
        counters: Arc<Counters>,
    ) -> Self {
        Self { client, bucket, per_attempt_timeout, app_retries: app_retries.max(1), counters }
    }

    /// Waits out one backoff interval, but returns a cancellation error
    /// immediately if `cancel` fires first (`spec.md` §4.5 "the cancel token
    /// is checked during the backoff wait").
    async fn wait_backoff(cancel: &CancellationToken, delay: Duration) -> Result<(), UploadError> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        }
    }

    async fn put_once(&self, key: &str, body: ByteStream, content_length: Option<i64>) -> Result<(), UploadError> {
        let mut req = self.client.put_object().bucket(&self.bucket).key(key).body(body);
        if let Some(len) = content_length {
            req = req.content_length(len);
        }
        match tokio::time::timeout(self.per_attempt_timeout, req.send()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(UploadError::Store { message: e.to_string() }),
            Err(_) => Err(UploadError::Timeout),
        }
    }

    fn note_attempt_failure(&self, attempt: u32, key: &str, error: &UploadError) {
        self.counters.put_error.fetch_add(1, Ordering::Relaxed);
        warn!(attempt, key, %error, internal_log_rate_limit = true, "object-store PUT attempt failed");
    }
}

#[async_trait::async_trait]
impl Uploader for S3Uploader {
    async fn upload_bytes(&self, cancel: &CancellationToken, key: &str, bytes: Bytes) -> Result<(), UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let mut delay = INITIAL_BACKOFF;
        let mut last_err = None;
        for attempt in 0..self.app_retries {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let body = ByteStream::from(bytes.clone());
            match self.put_once(key, body, None).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.note_attempt_failure(attempt, key, &e);
                    last_err = Some(e);
                    if attempt + 1 < self.app_retries {
                        Self::wait_backoff(cancel, delay).await?;
                        delay = (delay * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
        Err(last_err.unwrap_or(UploadError::Store { message: "no attempts made".into() }))
    }

    async fn upload_stream(
        &self,
        cancel: &CancellationToken,
        key: &str,
        file: &mut tokio::fs::File,
        size: u64,
    ) -> Result<(), UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let mut delay = INITIAL_BACKOFF;
        let mut last_err = None;
        for attempt in 0..self.app_retries {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            file.seek(std::io::SeekFrom::Start(0)).await.map_err(|source| UploadError::Io { source })?;
            let mut buf = vec![0u8; size as usize];
            file.read_exact(&mut buf).await.map_err(|source| UploadError::Io { source })?;
            let body = ByteStream::from(buf);

            match self.put_once(key, body, Some(size as i64)).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.note_attempt_failure(attempt, key, &e);
                    last_err = Some(e);
                    if attempt + 1 < self.app_retries {
                        Self::wait_backoff(cancel, delay).await?;
                        delay = (delay * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
        Err(last_err.unwrap_or(UploadError::Store { message: "no attempts made".into() }))
    }
}
