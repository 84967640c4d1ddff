//! The failure queue: durably parks encoded batches the uploader could not
//! deliver, and replays them later without the critical path ever paying
//! `O(N)` in the number of parked files (`spec.md` §4.6).

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use ingest_common::{Counters, KeyBuilder, TimeCache, UploadError, Uploader};
use snafu::ResultExt;
use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{FqError, ReadDirSnafu, RemoveSnafu, RenameSnafu, SidecarSerializeSnafu, WriteSnafu};
use crate::record::{self, Sidecar};

/// The partial scan never reads more than this many raw directory entries
/// per call, regardless of how many files are actually parked (spec.md §4.6.3).
pub const PARTIAL_SCAN_LIMIT: usize = 1000;

pub struct FailureQueue {
    dir: PathBuf,
    max_size_bytes: u64,
    max_age: Duration,
    counters: Arc<Counters>,
    time: Arc<TimeCache>,
    keys: Arc<KeyBuilder>,
}

impl FailureQueue {
    /// Enumerates `dir` once, deleting orphan sidecars and accounting for
    /// every remaining data file in the byte-size and file-count gauges
    /// (spec.md §4.6.1).
    #[instrument(skip(counters, time, keys), fields(dir = %dir.display()))]
    pub async fn init(
        dir: PathBuf,
        max_size_bytes: u64,
        max_age: Duration,
        counters: Arc<Counters>,
        time: Arc<TimeCache>,
        keys: Arc<KeyBuilder>,
    ) -> Result<Self, FqError> {
        tokio::fs::create_dir_all(&dir).await.context(WriteSnafu { path: dir.clone() })?;

        let mut entries = tokio::fs::read_dir(&dir).await.context(ReadDirSnafu { path: dir.clone() })?;
        while let Some(entry) = entries.next_entry().await.context(ReadDirSnafu { path: dir.clone() })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(base) = name.strip_suffix(record::META_SUFFIX) {
                let data = record::data_path(&dir, base);
                if tokio::fs::metadata(&data).await.is_err() {
                    let sidecar = record::meta_path(&dir, base);
                    debug!(sidecar = %sidecar.display(), "removing orphan sidecar");
                    let _ = tokio::fs::remove_file(&sidecar).await;
                }
            } else if record::base_name(&name).is_some() {
                if let Ok(meta) = entry.metadata().await {
                    counters.fq_byte_size_add(meta.len() as i64);
                    counters.fq_file_count_add(1);
                }
            }
        }

        Ok(Self { dir, max_size_bytes, max_age, counters, time, keys })
    }

    /// Parks `bytes` (an encoded batch of `num_events` events) on disk. A
    /// no-op for an empty batch; drops the batch (counted) if capacity cannot
    /// be freed (spec.md §4.6.2).
    #[instrument(skip(self, bytes), fields(num_events, len = bytes.len()))]
    pub async fn save(&self, bytes: &[u8], num_events: u64) -> Result<(), FqError> {
        if num_events == 0 || bytes.is_empty() {
            return Ok(());
        }

        if !self.ensure_capacity(bytes.len() as u64).await? {
            self.counters.fq_dropped_events.fetch_add(num_events, Ordering::Relaxed);
            warn!(
                num_events,
                len = bytes.len(),
                internal_log_rate_limit = true,
                "failure queue at capacity, dropping batch irrecoverably"
            );
            return Ok(());
        }

        let filename = self.keys.new_filename();
        let base = record::base_name(&filename).expect("key builder always produces a data filename");
        let data_path = record::data_path(&self.dir, base);
        let tmp_path = self.dir.join(format!("{filename}.tmp"));

        tokio::fs::write(&tmp_path, bytes).await.context(WriteSnafu { path: tmp_path.clone() })?;
        tokio::fs::rename(&tmp_path, &data_path)
            .await
            .context(RenameSnafu { from: tmp_path, to: data_path.clone() })?;

        let sidecar = serde_json::to_vec(&Sidecar::new(num_events)).context(SidecarSerializeSnafu)?;
        let meta_path = record::meta_path(&self.dir, base);
        tokio::fs::write(&meta_path, sidecar).await.context(WriteSnafu { path: meta_path })?;

        self.counters.fq_byte_size_add(bytes.len() as i64);
        self.counters.fq_file_count_add(1);
        self.counters.fq_enqueued.fetch_add(num_events, Ordering::Relaxed);

        Ok(())
    }

    /// Evicts oldest-first until `incoming_size` fits under `max_size_bytes`.
    /// Returns `Ok(true)` once there's room, `Ok(false)` if no data file
    /// remains and there still isn't (spec.md §4.6.2).
    async fn ensure_capacity(&self, incoming_size: u64) -> Result<bool, FqError> {
        if self.max_size_bytes == 0 {
            return Ok(true);
        }

        loop {
            let current = self.counters.fq_byte_size.load(Ordering::SeqCst).max(0) as u64;
            if current.saturating_add(incoming_size) <= self.max_size_bytes {
                return Ok(true);
            }

            match self.pick_oldest_base().await? {
                Some(base) => {
                    debug!(base = %base, "evicting oldest FQ record to free capacity");
                    self.evict(&base).await?;
                }
                None => return Ok(false),
            }
        }
    }

    async fn evict(&self, base: &str) -> Result<(), FqError> {
        let data_path = record::data_path(&self.dir, base);
        let size = tokio::fs::metadata(&data_path).await.map(|m| m.len()).unwrap_or(0);

        tokio::fs::remove_file(&data_path).await.context(RemoveSnafu { path: data_path })?;
        let meta_path = record::meta_path(&self.dir, base);
        let _ = tokio::fs::remove_file(&meta_path).await;

        self.counters.fq_byte_size_add(-(size as i64));
        self.counters.fq_file_count_add(-1);
        Ok(())
    }

    /// Reads at most [`PARTIAL_SCAN_LIMIT`] raw directory entries — never the
    /// whole directory — filters out sidecars and dotfiles, and returns the
    /// lexicographically-first base name among the entries read. This is "an
    /// oldest among the first K read", not the global oldest; see spec.md
    /// §4.6.3 for why that's sufficient.
    async fn pick_oldest_base(&self) -> Result<Option<String>, FqError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.context(ReadDirSnafu { path: self.dir.clone() })?;

        let mut raw_names = Vec::with_capacity(PARTIAL_SCAN_LIMIT);
        for _ in 0..PARTIAL_SCAN_LIMIT {
            match entries.next_entry().await.context(ReadDirSnafu { path: self.dir.clone() })? {
                Some(entry) => raw_names.push(entry.file_name().to_string_lossy().into_owned()),
                None => break,
            }
        }

        let mut candidates: Vec<String> = raw_names
            .into_iter()
            .filter(|name| !name.starts_with('.') && !name.ends_with(record::META_SUFFIX))
            .filter_map(|name| record::base_name(&name).map(str::to_owned))
            .collect();
        candidates.sort();

        Ok(candidates.into_iter().next())
    }

    /// Replays exactly one oldest candidate, if any (spec.md §4.6.4).
    #[instrument(skip(self, uploader, cancel))]
    pub async fn replay_one(
        &self,
        uploader: &dyn Uploader,
        cancel: &CancellationToken,
        raw_prefix: &str,
        dead_letter_prefix: &str,
    ) -> Result<(), FqError> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let Some(base) = self.pick_oldest_base().await? else {
            return Ok(());
        };

        let data_path = record::data_path(&self.dir, &base);
        let size = match tokio::fs::metadata(&data_path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                let meta_path = record::meta_path(&self.dir, &base);
                let _ = tokio::fs::remove_file(&meta_path).await;
                self.counters.fq_file_count_add(-1);
                return Ok(());
            }
        };

        if let Some(created_at) = record::parse_unix_prefix(&base) {
            let age = self.time.unix() - created_at;
            if age > self.max_age.as_secs() as i64 {
                self.evict(&base).await?;
                self.counters.fq_expired_files.fetch_add(1, Ordering::Relaxed);
                debug!(base = %base, age, "FQ record exceeded MaxAge, deleted without replay");
                return Ok(());
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut file = match tokio::fs::File::open(&data_path).await {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };

        let corrupt = !validate_gzip_jsonl(&data_path).await;
        let target_prefix = if corrupt { dead_letter_prefix } else { raw_prefix };

        if let Err(e) = file.seek(std::io::SeekFrom::Start(0)).await {
            warn!(error = %e, base = %base, "failed to rewind FQ data file before replay");
            return Ok(());
        }

        let filename = format!("{base}{}", record::DATA_SUFFIX);
        let key = self.keys.build_object_key(target_prefix, &filename);

        match uploader.upload_stream(cancel, &key, &mut file, size).await {
            Ok(()) => {
                drop(file);
                let meta_path = record::meta_path(&self.dir, &base);
                let num_events = record::read_num_events(&meta_path).await;

                tokio::fs::remove_file(&data_path).await.context(RemoveSnafu { path: data_path })?;
                let _ = tokio::fs::remove_file(&meta_path).await;

                self.counters.fq_byte_size_add(-(size as i64));
                self.counters.fq_file_count_add(-1);
                self.counters.fq_reuploaded.fetch_add(num_events, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                log_replay_failure(&base, &e);
                Ok(())
            }
        }
    }
}

fn log_replay_failure(base: &str, error: &UploadError) {
    warn!(base, %error, internal_log_rate_limit = true, "FQ replay upload failed, leaving files in place for retry");
}

/// Attempts to decompress `path` as gzip and parse its first non-empty line
/// as a JSON object. Used purely to decide raw-prefix vs. dead-letter-prefix
/// routing; the bytes are uploaded either way (spec.md §4.6.4 step 6).
async fn validate_gzip_jsonl(path: &std::path::Path) -> bool {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(_) => return false,
    };

    let Ok(decoded) = decompress(&bytes) else { return false };
    let first_line = decoded.split(|&b| b == b'\n').find(|line| !line.is_empty());
    match first_line {
        Some(line) => serde_json::from_slice::<serde_json::Value>(line)
            .map(|v| v.is_object())
            .unwrap_or(false),
        None => false,
    }
}

fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(Cursor::new(bytes));
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out)?;
    Ok(out)
}
