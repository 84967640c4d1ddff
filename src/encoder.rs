//! Batch -> gzip-compressed JSON-Lines encoder (`spec.md` §4.3).
//!
//! Returns an owned compressed buffer drawn from the [`BufferPool`] rather
//! than a copy, since doubling peak memory on the upload critical path
//! matters at ~5 MiB batches under a fractional-core container's memory
//! ceiling. The gzip container is built by hand around a raw-deflate
//! [`Compress`] worker (see `ingest_common::pools::CompressPool`) so the
//! compressor itself stays poolable across batches — `flate2::GzEncoder`
//! owns its writer and can't be reset onto a different pooled buffer the way
//! a bare `Compress` can.

use flate2::{Compress, FlushCompress, Status};
use ingest_common::{BufferPool, CompressPool, Event};
use serde::Serialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum EncodeError {
    #[snafu(display("failed to serialize event: {source}"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("gzip compression failed: {source}"))]
    Compress { source: flate2::CompressError },
}

#[derive(Serialize)]
struct EventFields<'a> {
    ts: i64,
    ip: &'a str,
    user_agent: &'a str,
    cookie: &'a str,
    body: &'a str,
}

impl<'a> From<&'a Event> for EventFields<'a> {
    fn from(e: &'a Event) -> Self {
        Self { ts: e.ts, ip: &e.ip, user_agent: &e.user_agent, cookie: &e.cookie, body: &e.body }
    }
}

/// Encodes and recycles batches, backed by the process-wide compressor and
/// buffer pools.
pub struct Encoder {
    compress_pool: CompressPool,
    buffer_pool: BufferPool,
}

impl Encoder {
    pub fn new(compress_pool: CompressPool, buffer_pool: BufferPool) -> Self {
        Self { compress_pool, buffer_pool }
    }

    /// Encodes `events` (in order) as gzip-compressed JSON Lines. On success,
    /// ownership of the returned buffer passes to the caller, which turns it
    /// into a `Bytes` for the upload/FQ handoff (its allocation is not
    /// returned to `self.buffer_pool`; see `DESIGN.md`'s "buffer-pool return
    /// on the network handoff" note). On failure, both the compressor and the
    /// scratch buffer are released back to their pools before the error is
    /// returned.
    pub fn encode(&self, events: &[Event]) -> Result<Vec<u8>, EncodeError> {
        let mut compress = self.compress_pool.acquire();
        let mut out = self.buffer_pool.acquire();
        out.extend_from_slice(&GZIP_HEADER_FASTEST);

        let mut crc = crc32fast::Hasher::new();
        let mut total_in: u32 = 0;

        let result = (|| -> Result<(), EncodeError> {
            for event in events {
                let line = serde_json::to_vec(&EventFields::from(event)).context(SerializeSnafu)?;
                crc.update(&line);
                crc.update(b"\n");
                total_in = total_in.wrapping_add(line.len() as u32 + 1);
                compress_into(&mut compress, &line, &mut out, FlushCompress::None)?;
                compress_into(&mut compress, b"\n", &mut out, FlushCompress::None)?;
            }
            compress_into(&mut compress, &[], &mut out, FlushCompress::Finish)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                out.extend_from_slice(&crc.finalize().to_le_bytes());
                out.extend_from_slice(&total_in.to_le_bytes());
                self.compress_pool.release(compress);
                Ok(out)
            }
            Err(e) => {
                self.compress_pool.release(compress);
                self.buffer_pool.release(out);
                Err(e)
            }
        }
    }

    /// Clears every event in `events` and returns it to the event pool.
    /// Called exactly once per batch regardless of upload outcome (`spec.md`
    /// §4.3 `recycle`).
    pub fn recycle(&self, events: Vec<Event>, event_pool: &ingest_common::Pool<Event>) {
        for event in events {
            event_pool.release(event);
        }
    }
}

/// Drives `compress` until all of `input` has been consumed (and, for
/// `Finish`, until the stream end is reached), growing `out`'s spare capacity
/// as needed since `compress_vec` only ever writes into existing capacity.
fn compress_into(
    compress: &mut Compress,
    mut input: &[u8],
    out: &mut Vec<u8>,
    flush: FlushCompress,
) -> Result<(), EncodeError> {
    loop {
        if out.len() == out.capacity() {
            out.reserve(4096);
        }
        let before_in = compress.total_in();
        let status = compress.compress_vec(input, out, flush).context(CompressSnafu)?;
        let consumed = (compress.total_in() - before_in) as usize;
        input = &input[consumed..];

        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                if input.is_empty() && !matches!(flush, FlushCompress::Finish) {
                    return Ok(());
                }
                // Either more input remains, or we're flushing to completion
                // and haven't seen `StreamEnd` yet: give the compressor more
                // room and loop.
                out.reserve(4096);
            }
        }
    }
}

/// RFC 1952 gzip header for a fastest-speed stream: magic, deflate method, no
/// flags, zero mtime, `XFL = 4` ("fastest algorithm", matching
/// `flate2::GzBuilder`'s own convention for `Compression::fast()`), and OS
/// byte `0xff` ("unknown").
const GZIP_HEADER_FASTEST: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0xff];

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use ingest_common::{DEFAULT_INITIAL_BUFFER_CAPACITY, DEFAULT_MAX_BUFFER_CAPACITY};
    use std::io::Read;

    fn make_encoder() -> Encoder {
        Encoder::new(
            CompressPool::new(),
            BufferPool::new(DEFAULT_INITIAL_BUFFER_CAPACITY, DEFAULT_MAX_BUFFER_CAPACITY),
        )
    }

    fn event(body: &str) -> Event {
        Event { ts: 42, ip: "1.2.3.4".into(), user_agent: "ua".into(), cookie: "c".into(), body: body.into() }
    }

    #[test]
    fn round_trips_events_in_order() {
        let encoder = make_encoder();
        let events = vec![event("a"), event("b"), event("c")];
        let encoded = encoder.encode(&events).unwrap();

        let mut decoder = GzDecoder::new(&encoded[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();

        let lines: Vec<&str> = decompressed.lines().collect();
        assert_eq!(lines.len(), 3);
        let bodies: Vec<String> = lines
            .iter()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["body"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(bodies, vec!["a", "b", "c"]);

        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            let obj = value.as_object().unwrap();
            let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
            keys.sort();
            assert_eq!(keys, vec!["body", "cookie", "ip", "ts", "user_agent"]);
        }
    }

    #[test]
    fn empty_batch_encodes_to_valid_empty_gzip() {
        let encoder = make_encoder();
        let encoded = encoder.encode(&[]).unwrap();
        let mut decoder = GzDecoder::new(&encoded[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
