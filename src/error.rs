//! Top-level startup errors (`spec.md` §6 "Exit codes"). Only failures that
//! happen before the pipeline starts serving traffic are represented here;
//! once the HTTP collaborator is bound, failures are handled per-request or
//! logged and retried, never surfaced as a process exit.

use snafu::Snafu;

use crate::config::ConfigError;

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("failed to initialize the failure queue: {source}"))]
    FailureQueue { source: ingest_queue::FqError },

    #[snafu(display("failed to bind HTTP listener on {addr}: {source}"))]
    Bind { addr: std::net::SocketAddr, source: std::io::Error },
}

impl AppError {
    /// Maps a startup failure to a process exit code, using the conventional
    /// BSD `sysexits.h` codes the teacher's binaries already exit with.
    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            AppError::Config { .. } => exitcode::CONFIG,
            AppError::FailureQueue { .. } => exitcode::IOERR,
            AppError::Bind { .. } => exitcode::OSERR,
        }
    }
}
