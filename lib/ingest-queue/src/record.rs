//! FQ record naming and the metadata sidecar (`spec.md` §3 "FQ record", §6
//! "Persisted state").

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DATA_SUFFIX: &str = ".jsonl.gz";
pub const META_SUFFIX: &str = ".meta.json";

/// `<base>.meta.json`: `{"num_events": N}`. A data file without a sidecar is
/// valid and defaults to `num_events = 1` (spec.md §3).
#[derive(Debug, Serialize, Deserialize)]
pub struct Sidecar {
    pub num_events: u64,
}

impl Sidecar {
    pub fn new(num_events: u64) -> Self {
        Self { num_events }
    }
}

/// Strips the `.jsonl.gz` suffix from a data filename, returning the shared
/// base name, or `None` if `name` isn't a data file.
pub fn base_name(data_filename: &str) -> Option<&str> {
    data_filename.strip_suffix(DATA_SUFFIX)
}

pub fn sidecar_name(base: &str) -> String {
    format!("{base}{META_SUFFIX}")
}

pub fn data_path(dir: &Path, base: &str) -> PathBuf {
    dir.join(format!("{base}{DATA_SUFFIX}"))
}

pub fn meta_path(dir: &Path, base: &str) -> PathBuf {
    dir.join(sidecar_name(base))
}

/// Parses the `<unix>` prefix out of a base name (`<unix>_<instance>_<counter>`).
/// Used for TTL age checks and as the ordering key; filename ordering is
/// lexicographic, which coincides with temporal ordering because the unix
/// prefix is fixed-width within any reasonable operating window (spec.md §4.4).
pub fn parse_unix_prefix(base: &str) -> Option<i64> {
    let (unix_str, _) = base.split_once('_')?;
    unix_str.parse().ok()
}

/// Reads `num_events` from a sidecar file, defaulting to 1 if the sidecar is
/// missing, unparseable, or non-positive (spec.md §6).
pub async fn read_num_events(meta_path: &Path) -> u64 {
    match tokio::fs::read(meta_path).await {
        Ok(bytes) => match serde_json::from_slice::<Sidecar>(&bytes) {
            Ok(sidecar) if sidecar.num_events > 0 => sidecar.num_events,
            _ => 1,
        },
        Err(_) => 1,
    }
}
