//! `ingestord`: a high-throughput HTTP event-ingestion pipeline. Accepts
//! small JSON payloads over HTTP, batches them, gzip-encodes the batch as
//! JSON Lines, and uploads it to an object store under time-partitioned
//! keys, with a durable local failure queue standing in for the object store
//! when it's unreachable.
//!
//! Laid out as a thin binary (`main.rs`) over a library crate so the pipeline
//! internals are independently testable, in the same split the teacher uses
//! for its own components.

pub mod client_ip;
pub mod config;
pub mod encoder;
pub mod error;
pub mod http;
pub mod manager;
pub mod s3;
