//! The local failure queue: a durable parking lot for encoded batches the
//! object store couldn't accept (`spec.md` §4.6).

pub mod error;
pub mod queue;
pub mod record;

pub use error::FqError;
pub use queue::{FailureQueue, PARTIAL_SCAN_LIMIT};
pub use record::Sidecar;
