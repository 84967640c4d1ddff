//! Process-wide primitives shared by the ingestion pipeline: a once-per-second
//! time cache, reusable-object pools, the accepted-event record, and the
//! atomic counters/gauges exposed on the metrics route.

pub mod counters;
pub mod event;
pub mod key;
pub mod pools;
pub mod time_cache;
pub mod uploader;

pub use counters::Counters;
pub use event::Event;
pub use key::KeyBuilder;
pub use pools::{
    BufferPool, CompressPool, Pool, Poolable, DEFAULT_INITIAL_BUFFER_CAPACITY, DEFAULT_MAX_BUFFER_CAPACITY,
};
pub use time_cache::TimeCache;
pub use uploader::{UploadError, Uploader};
