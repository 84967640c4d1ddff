//! The object-store capability interface (`spec.md` §4.5, §9 "Dynamic
//! dispatch"). This is the only seam in the pipeline where swapping an
//! implementation matters — production code plugs in an S3-backed uploader
//! that runs the full per-attempt-timeout/retry/backoff loop from §4.5 inside
//! each method; tests plug in a fake that usually short-circuits to a single
//! attempt, since failure injection doesn't need the backoff loop to be
//! realistic.

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum UploadError {
    #[snafu(display("upload cancelled"))]
    Cancelled,
    #[snafu(display("upload attempt timed out"))]
    Timeout,
    #[snafu(display("object store rejected the request: {message}"))]
    Store { message: String },
    #[snafu(display("failed to read local file for upload: {source}"))]
    Io { source: std::io::Error },
}

/// A single PUT of either an in-memory buffer or an on-disk file, with no
/// retry logic of its own: each call is exactly one attempt.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload an in-memory buffer. Used for freshly-encoded batches.
    async fn upload_bytes(
        &self,
        cancel: &CancellationToken,
        key: &str,
        bytes: Bytes,
    ) -> Result<(), UploadError>;

    /// Upload a rewindable file of known size. Used for failure-queue replay,
    /// where the payload already lives on disk and need not be loaded whole
    /// into memory. The caller is responsible for seeking `file` back to the
    /// start before each attempt.
    async fn upload_stream(
        &self,
        cancel: &CancellationToken,
        key: &str,
        file: &mut File,
        size: u64,
    ) -> Result<(), UploadError>;
}
