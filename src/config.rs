//! Configuration surface recognized by the pipeline (`spec.md` §6). Loaded
//! once at startup from environment variables, with a thin `clap` layer on
//! top for overriding the failure-queue directory and log level without a
//! redeploy — the teacher's pattern of layering CLI flags over
//! environment/file config, just with env as the only backing store here
//! (config-file loading is an explicit Non-goal per `spec.md` §1).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("missing required environment variable {name}"))]
    Missing { name: &'static str },

    #[snafu(display("invalid value for {name}: {source}"))]
    InvalidInt { name: &'static str, source: std::num::ParseIntError },

    #[snafu(display("invalid duration for {name}: {source}"))]
    InvalidDuration { name: &'static str, source: humantime::DurationError },

    #[snafu(display("invalid socket address for {name}: {source}"))]
    InvalidAddr { name: &'static str, source: std::net::AddrParseError },
}

/// CLI overrides layered over the environment, per `spec.md` §A.3. Every
/// field is optional: `None` means "use the environment / built-in default".
#[derive(Debug, clap::Parser)]
#[command(name = "ingestord", version, about = "HTTP event ingestion pipeline")]
pub struct Args {
    /// Overrides DLQDir without touching the environment.
    #[arg(long)]
    pub dlq_dir: Option<PathBuf>,

    /// Overrides LogLevel (an `EnvFilter` directive, e.g. "info" or "ingestord=debug").
    #[arg(long)]
    pub log_level: Option<String>,

    /// Render logs as JSON instead of the default ANSI-colored human format.
    #[arg(long)]
    pub log_json: bool,
}

/// The full recognized configuration surface (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub aws_region: String,
    pub raw_bucket: String,
    pub raw_prefix: String,
    pub dlq_prefix: String,
    pub instance_id: String,
    pub http_addr: SocketAddr,
    pub max_body_size: usize,
    pub channel_size: usize,
    pub upload_queue: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub s3_timeout: Duration,
    pub s3_app_retries: u32,
    pub dlq_dir: PathBuf,
    pub dlq_max_age: Duration,
    pub dlq_max_size_bytes: u64,
    pub log_level: String,
    pub log_json: bool,
    /// `LogSampleN`: when set, rate-limits repeated hot-path log lines (upload
    /// retries, FQ corruption/TTL/capacity events) to at most once per this
    /// many seconds per call site, via `tracing-limit` (spec.md §6 "optional
    /// logging knobs").
    pub log_sample_n: Option<u64>,
}

fn env_var(name: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(Some(v)),
        Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Ok(None),
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env_var(name)?.ok_or(ConfigError::Missing { name })
}

fn with_default(name: &'static str, default: &str) -> Result<String, ConfigError> {
    Ok(env_var(name)?.unwrap_or_else(|| default.to_string()))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env_var(name)? {
        Some(v) => v.parse().context(InvalidIntSnafu { name }),
        None => Ok(default),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_var(name)? {
        Some(v) => v.parse().context(InvalidIntSnafu { name }),
        None => Ok(default),
    }
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match env_var(name)? {
        Some(v) => v.parse().context(InvalidIntSnafu { name }),
        None => Ok(default),
    }
}

fn parse_duration(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env_var(name)? {
        Some(v) => v.parse::<humantime::Duration>().map(Into::into).context(InvalidDurationSnafu { name }),
        None => Ok(default),
    }
}

impl Config {
    /// Loads configuration from the environment, then applies CLI overrides.
    /// `RawBucket` and `AWSRegion` are the only fatal-if-missing keys (`spec.md`
    /// §6 Exit codes: "missing required configuration").
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let instance_id = with_default("INSTANCE_ID", &default_instance_id())?;

        let http_addr_str = with_default("HTTP_ADDR", "0.0.0.0:8080")?;
        let http_addr = http_addr_str.parse().context(InvalidAddrSnafu { name: "HTTP_ADDR" })?;

        let dlq_dir = match &args.dlq_dir {
            Some(p) => p.clone(),
            None => PathBuf::from(with_default("DLQ_DIR", "/var/lib/ingestord/dlq")?),
        };

        let log_level = args
            .log_level
            .clone()
            .map(Ok)
            .unwrap_or_else(|| with_default("LOG_LEVEL", "info"))?;

        Ok(Self {
            aws_region: required("AWS_REGION")?,
            raw_bucket: required("RAW_BUCKET")?,
            raw_prefix: with_default("RAW_PREFIX", "raw")?,
            dlq_prefix: with_default("DLQ_PREFIX", "dead-letter")?,
            instance_id,
            http_addr,
            max_body_size: parse_usize("MAX_BODY_SIZE", 64 * 1024)?,
            channel_size: parse_usize("CHANNEL_SIZE", 10_000)?,
            upload_queue: parse_usize("UPLOAD_QUEUE", 64)?,
            batch_size: parse_usize("BATCH_SIZE", 500)?,
            flush_interval: parse_duration("FLUSH_INTERVAL", Duration::from_secs(5))?,
            s3_timeout: parse_duration("S3_TIMEOUT", Duration::from_secs(3))?,
            s3_app_retries: parse_u32("S3_APP_RETRIES", 2)?,
            dlq_dir,
            dlq_max_age: parse_duration("DLQ_MAX_AGE", Duration::from_secs(24 * 3600))?,
            dlq_max_size_bytes: parse_u64("DLQ_MAX_SIZE_BYTES", 1024 * 1024 * 1024)?,
            log_level,
            log_json: args.log_json || env_var("LOG_JSON")?.is_some(),
            log_sample_n: match env_var("LOG_SAMPLE_N")? {
                Some(v) => Some(v.parse().context(InvalidIntSnafu { name: "LOG_SAMPLE_N" })?),
                None => None,
            },
        })
    }
}

/// Falls back to a random instance ID (no hyphens, since the FQ filename
/// grammar forbids `_` and `/` but a `-`-bearing UUID is fine as the
/// `<instance>` segment — `spec.md` §6 filename grammar).
fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
