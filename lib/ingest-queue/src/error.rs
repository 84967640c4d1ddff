use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum FqError {
    #[snafu(display("failed to read failure queue directory {path:?}: {source}"))]
    ReadDir { path: std::path::PathBuf, source: std::io::Error },

    #[snafu(display("failed to write failure queue file {path:?}: {source}"))]
    Write { path: std::path::PathBuf, source: std::io::Error },

    #[snafu(display("failed to remove failure queue file {path:?}: {source}"))]
    Remove { path: std::path::PathBuf, source: std::io::Error },

    #[snafu(display("failed to rename {from:?} to {to:?}: {source}"))]
    Rename { from: std::path::PathBuf, to: std::path::PathBuf, source: std::io::Error },

    #[snafu(display("failed to serialize sidecar metadata: {source}"))]
    SidecarSerialize { source: serde_json::Error },
}
