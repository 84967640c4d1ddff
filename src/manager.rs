//! The pipeline orchestrator (`spec.md` §4.7): owns the two bounded channels,
//! the batch-builder task, the upload task, and drives the ordered
//! graceful-drain shutdown. The `select`-over-two-sources pattern in both
//! tasks is preserved verbatim per `spec.md` §9 — it is load-bearing.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ingest_common::{Counters, Event, KeyBuilder, Pool, Uploader};
use ingest_queue::FailureQueue;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::encoder::Encoder;

/// How many idle-time (or post-batch) FQ replay attempts the upload task
/// makes per tick, to keep the failure queue draining without starving fresh
/// uploads (`spec.md` §4.7.2).
const REPLAYS_PER_TICK: usize = 3;
const UPLOAD_TICK: Duration = Duration::from_millis(50);

/// An ordered sequence of event references constituting a single batch
/// (`spec.md` §3). Invariant: `1 <= events.len() <= BatchSize`, enforced by
/// construction in the batch-builder task.
struct UploadJob {
    events: Vec<Event>,
}

pub struct ManagerConfig {
    pub channel_size: usize,
    pub upload_queue: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub raw_prefix: String,
    pub dead_letter_prefix: String,
}

/// The running pipeline: a shared handle used by the HTTP collaborator to
/// push events, and by `main` to drive a graceful shutdown.
pub struct Manager {
    event_tx: std::sync::Mutex<Option<mpsc::Sender<Event>>>,
    event_pool: Arc<Pool<Event>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Manager {
    /// Wires the channels and spawns the batch-builder and upload tasks.
    pub fn start(
        config: ManagerConfig,
        encoder: Arc<Encoder>,
        uploader: Arc<dyn Uploader>,
        fq: Arc<FailureQueue>,
        keys: Arc<KeyBuilder>,
        event_pool: Arc<Pool<Event>>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel::<Event>(config.channel_size.max(1));
        let (upload_tx, upload_rx) = mpsc::channel::<UploadJob>(config.upload_queue.max(1));
        let cancel = CancellationToken::new();

        let batch_builder = tokio::spawn(batch_builder_task(event_rx, upload_tx, config.batch_size, config.flush_interval));

        let upload_task = tokio::spawn(upload_task(
            upload_rx,
            encoder,
            uploader,
            fq,
            keys,
            Arc::clone(&event_pool),
            Arc::clone(&counters),
            cancel.clone(),
            config.raw_prefix,
            config.dead_letter_prefix,
        ));

        Arc::new(Self {
            event_tx: std::sync::Mutex::new(Some(event_tx)),
            event_pool,
            counters,
            cancel,
            tasks: Mutex::new(Some((batch_builder, upload_task))),
        })
    }

    /// Non-blocking push onto the event channel (`spec.md` §6): the sole
    /// backpressure signal visible to HTTP clients. On a full or closed
    /// channel the event is recycled, never dropped silently, and the
    /// queue-full counter is incremented.
    pub fn try_push(&self, event: Event) -> bool {
        let guard = self.event_tx.lock().expect("event_tx mutex poisoned");
        let Some(tx) = guard.as_ref() else {
            drop(guard);
            self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
            self.event_pool.release(event);
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                self.event_pool.release(event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                self.event_pool.release(event);
                false
            }
        }
    }

    /// Single-shot, idempotent graceful drain (`spec.md` §4.7.3). Critical
    /// ordering: close the event channel, wait for both tasks to drain, only
    /// then cancel the long-lived token. Reversing this order can lose the
    /// last in-flight batch.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let taken = self.tasks.lock().await.take();
        let Some((batch_builder, upload_task)) = taken else {
            return;
        };

        // Step 1: close the event channel. No further events can be
        // accepted; the HTTP collaborator must have already stopped
        // accepting (spec.md §6).
        self.event_tx.lock().expect("event_tx mutex poisoned").take();

        // Step 2: wait for both tasks to exit. The batch-builder observes
        // the closed event channel, flushes its residual batch (which may
        // block on the upload channel), and closes the upload channel; the
        // upload task observes that closed channel and exits after draining.
        if let Err(e) = batch_builder.await {
            warn!(error = %e, "batch-builder task panicked during shutdown");
        }
        if let Err(e) = upload_task.await {
            warn!(error = %e, "upload task panicked during shutdown");
        }

        // Step 3: only now cancel the long-lived token, unblocking any
        // in-flight upload retries the outer deadline hasn't yet reached.
        self.cancel.cancel();
        info!("pipeline shutdown complete");
    }
}

/// `spec.md` §4.7.1. Accumulates events into `batch`, flushing on whichever
/// comes first: `BatchSize` reached, or `FlushInterval` elapses.
async fn batch_builder_task(
    mut event_rx: mpsc::Receiver<Event>,
    upload_tx: mpsc::Sender<UploadJob>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<Event> = Vec::with_capacity(batch_size);
    let mut timer: Pin<Box<Sleep>> = Box::pin(tokio::time::sleep(flush_interval));

    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            flush(&mut batch, &upload_tx, batch_size).await;
                            timer.as_mut().reset(Instant::now() + flush_interval);
                        }
                    }
                    None => {
                        // Event channel closed: flush once more, then close
                        // the upload channel by dropping our sender.
                        flush(&mut batch, &upload_tx, batch_size).await;
                        drop(upload_tx);
                        return;
                    }
                }
            }
            _ = &mut timer => {
                flush(&mut batch, &upload_tx, batch_size).await;
                timer.as_mut().reset(Instant::now() + flush_interval);
            }
        }
    }
}

/// Sends `batch` (if non-empty) as a blocking send on the upload channel —
/// the pipeline's one backpressure point (`spec.md` §4.7.1) — then replaces
/// it with a fresh `Vec`, never reusing the storage, to avoid aliasing with
/// the job the upload task now owns.
async fn flush(batch: &mut Vec<Event>, upload_tx: &mpsc::Sender<UploadJob>, batch_size_hint: usize) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::replace(batch, Vec::with_capacity(batch_size_hint));
    // A closed upload channel only happens during shutdown race between this
    // task exiting and the upload task already having exited; nothing to do
    // but drop the job, since its events were already moved out of the pool
    // and there is no longer a consumer to recycle them through.
    let _ = upload_tx.send(UploadJob { events }).await;
}

/// `spec.md` §4.7.2. Processes arriving upload jobs and, between jobs and on
/// idle ticks, asks the failure queue to replay its oldest candidates.
#[allow(clippy::too_many_arguments)]
async fn upload_task(
    mut upload_rx: mpsc::Receiver<UploadJob>,
    encoder: Arc<Encoder>,
    uploader: Arc<dyn Uploader>,
    fq: Arc<FailureQueue>,
    keys: Arc<KeyBuilder>,
    event_pool: Arc<Pool<Event>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    raw_prefix: String,
    dead_letter_prefix: String,
) {
    let mut ticker = tokio::time::interval(UPLOAD_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_job = upload_rx.recv() => {
                match maybe_job {
                    Some(job) => {
                        process_upload(
                            job, &encoder, uploader.as_ref(), &fq, &keys, &event_pool, &counters,
                            &cancel, &raw_prefix, &dead_letter_prefix,
                        ).await;
                        for _ in 0..REPLAYS_PER_TICK {
                            let _ = fq.replay_one(uploader.as_ref(), &cancel, &raw_prefix, &dead_letter_prefix).await;
                        }
                    }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                for _ in 0..REPLAYS_PER_TICK {
                    let _ = fq.replay_one(uploader.as_ref(), &cancel, &raw_prefix, &dead_letter_prefix).await;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(num_events = job.events.len()))]
async fn process_upload(
    job: UploadJob,
    encoder: &Encoder,
    uploader: &dyn Uploader,
    fq: &FailureQueue,
    keys: &KeyBuilder,
    event_pool: &Pool<Event>,
    counters: &Counters,
    cancel: &CancellationToken,
    raw_prefix: &str,
    dead_letter_prefix: &str,
) {
    if job.events.is_empty() {
        return;
    }
    let job_len = job.events.len() as u64;

    match encoder.encode(&job.events) {
        Ok(encoded) => {
            let bytes = Bytes::from(encoded);
            let filename = keys.new_filename();
            let key = keys.build_object_key(raw_prefix, &filename);

            match uploader.upload_bytes(cancel, &key, bytes.clone()).await {
                Ok(()) => {
                    counters.stored_events.fetch_add(job_len, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, key, "upload failed persistently, parking batch in the failure queue");
                    if let Err(e) = fq.save(&bytes, job_len).await {
                        warn!(error = %e, "failed to park batch in the failure queue");
                    }
                }
            }
        }
        Err(e) => {
            counters.put_error.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "batch encoding failed, attempting best-effort dead-letter of raw bodies");

            let raw_bodies: String = job.events.iter().map(|e| e.body.as_str()).collect::<Vec<_>>().join("\n");
            let filename = keys.new_filename();
            let key = keys.build_object_key(dead_letter_prefix, &filename);
            if let Err(e) = uploader.upload_bytes(cancel, &key, Bytes::from(raw_bodies.into_bytes())).await {
                warn!(error = %e, key, "best-effort dead-letter upload of raw bodies also failed");
            }
            counters.fq_enqueued.fetch_add(job_len, Ordering::Relaxed);
        }
    }

    encoder.recycle(job.events, event_pool);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flate2::read::GzDecoder;
    use ingest_common::{BufferPool, CompressPool, TimeCache};
    use std::io::Read as _;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    enum Mode {
        AlwaysSucceed,
        AlwaysFail,
        Block(Duration),
    }

    struct FakeUploader {
        mode: Mode,
        calls: StdMutex<Vec<String>>,
    }

    impl FakeUploader {
        fn new(mode: Mode) -> Self {
            Self { mode, calls: StdMutex::new(Vec::new()) }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Uploader for FakeUploader {
        async fn upload_bytes(
            &self,
            _cancel: &CancellationToken,
            key: &str,
            _bytes: Bytes,
        ) -> Result<(), ingest_common::UploadError> {
            self.calls.lock().unwrap().push(key.to_string());
            match &self.mode {
                Mode::AlwaysSucceed => Ok(()),
                Mode::AlwaysFail => Err(ingest_common::UploadError::Store { message: "fake failure".into() }),
                Mode::Block(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(())
                }
            }
        }

        async fn upload_stream(
            &self,
            _cancel: &CancellationToken,
            key: &str,
            _file: &mut tokio::fs::File,
            _size: u64,
        ) -> Result<(), ingest_common::UploadError> {
            self.calls.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    async fn new_fq(dir: &std::path::Path, time: Arc<TimeCache>, keys: Arc<KeyBuilder>, counters: Arc<Counters>) -> Arc<FailureQueue> {
        Arc::new(
            FailureQueue::init(dir.to_path_buf(), 0, Duration::from_secs(3600), counters, time, keys).await.unwrap(),
        )
    }

    fn decode_lines(bytes: &[u8]) -> Vec<String> {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out.lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["body"].as_str().unwrap().to_string())
            .collect()
    }

    fn event(body: &str) -> Event {
        Event { ts: 1, ip: "1.1.1.1".into(), user_agent: "ua".into(), cookie: "".into(), body: body.into() }
    }

    fn encoder() -> Arc<Encoder> {
        Arc::new(Encoder::new(CompressPool::new(), BufferPool::default()))
    }

    #[tokio::test]
    async fn happy_path_flushes_one_batch_on_batch_size() {
        let dir = tempdir().unwrap();
        let time = TimeCache::start(0);
        let counters = Arc::new(Counters::new());
        let keys = Arc::new(KeyBuilder::new(Arc::clone(&time), "inst"));
        let fq = new_fq(dir.path(), Arc::clone(&time), Arc::clone(&keys), Arc::clone(&counters)).await;
        let uploader = Arc::new(FakeUploader::new(Mode::AlwaysSucceed));

        let manager = Manager::start(
            ManagerConfig {
                channel_size: 8,
                upload_queue: 8,
                batch_size: 3,
                flush_interval: Duration::from_secs(60),
                raw_prefix: "raw".into(),
                dead_letter_prefix: "dead-letter".into(),
            },
            encoder(),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            fq,
            keys,
            Arc::new(Pool::new()),
            Arc::clone(&counters),
        );

        assert!(manager.try_push(event("a")));
        assert!(manager.try_push(event("b")));
        assert!(manager.try_push(event("c")));

        // Give the batch-builder/upload tasks a chance to run.
        for _ in 0..50 {
            if counters.stored_events.load(Ordering::Relaxed) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(counters.stored_events.load(Ordering::Relaxed), 3);
        assert_eq!(uploader.call_count(), 1);
        assert_eq!(counters.fq_enqueued.load(Ordering::Relaxed), 0);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn time_triggered_flush_fires_after_flush_interval() {
        let dir = tempdir().unwrap();
        let time = TimeCache::start(0);
        let counters = Arc::new(Counters::new());
        let keys = Arc::new(KeyBuilder::new(Arc::clone(&time), "inst"));
        let fq = new_fq(dir.path(), Arc::clone(&time), Arc::clone(&keys), Arc::clone(&counters)).await;
        let uploader = Arc::new(FakeUploader::new(Mode::AlwaysSucceed));

        let manager = Manager::start(
            ManagerConfig {
                channel_size: 8,
                upload_queue: 8,
                batch_size: 1000,
                flush_interval: Duration::from_secs(1),
                raw_prefix: "raw".into(),
                dead_letter_prefix: "dead-letter".into(),
            },
            encoder(),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            fq,
            keys,
            Arc::new(Pool::new()),
            Arc::clone(&counters),
        );

        assert!(manager.try_push(event("x")));
        assert!(manager.try_push(event("y")));
        // Let the batch-builder task actually poll the channel and register
        // its flush timer before we advance the (paused) clock past it.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;
        // Let the (also paused) upload-task tick run as well.
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert_eq!(uploader.call_count(), 1);
        assert_eq!(counters.stored_events.load(Ordering::Relaxed), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn backpressure_rejects_once_channel_and_upload_queue_are_full() {
        let dir = tempdir().unwrap();
        let time = TimeCache::start(0);
        let counters = Arc::new(Counters::new());
        let keys = Arc::new(KeyBuilder::new(Arc::clone(&time), "inst"));
        let fq = new_fq(dir.path(), Arc::clone(&time), Arc::clone(&keys), Arc::clone(&counters)).await;
        // The uploader blocks well past this test's window, so the single
        // upload-channel slot never frees up.
        let uploader = Arc::new(FakeUploader::new(Mode::Block(Duration::from_secs(10))));

        let manager = Manager::start(
            ManagerConfig {
                channel_size: 2,
                upload_queue: 1,
                batch_size: 1,
                flush_interval: Duration::from_secs(60),
                raw_prefix: "raw".into(),
                dead_letter_prefix: "dead-letter".into(),
            },
            encoder(),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            fq,
            keys,
            Arc::new(Pool::new()),
            Arc::clone(&counters),
        );

        // This test task never yields during the loop below, so on the
        // single-threaded test runtime neither spawned pipeline task gets a
        // chance to drain the event channel: exactly `channel_size` pushes
        // succeed before `try_send` starts seeing `Full` (spec.md scenario 3).
        let mut accepted = 0;
        for i in 0..5 {
            if manager.try_push(event(&i.to_string())) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 2);
        assert_eq!(counters.queue_full.load(Ordering::Relaxed), 3);

        // Give the batch-builder a moment to drain the channel into the
        // blocked upload task before the test (and its tempdir) tear down.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn upload_failure_parks_batch_in_failure_queue() {
        let dir = tempdir().unwrap();
        let time = TimeCache::start(0);
        let counters = Arc::new(Counters::new());
        let keys = Arc::new(KeyBuilder::new(Arc::clone(&time), "inst"));
        let fq = new_fq(dir.path(), Arc::clone(&time), Arc::clone(&keys), Arc::clone(&counters)).await;
        let uploader = Arc::new(FakeUploader::new(Mode::AlwaysFail));

        let manager = Manager::start(
            ManagerConfig {
                channel_size: 8,
                upload_queue: 8,
                batch_size: 1,
                flush_interval: Duration::from_secs(60),
                raw_prefix: "raw".into(),
                dead_letter_prefix: "dead-letter".into(),
            },
            encoder(),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            fq,
            keys,
            Arc::new(Pool::new()),
            Arc::clone(&counters),
        );

        assert!(manager.try_push(event("doomed")));

        for _ in 0..50 {
            if counters.fq_enqueued.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(counters.fq_enqueued.load(Ordering::Relaxed), 1);
        assert_eq!(counters.stored_events.load(Ordering::Relaxed), 0);
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2, "expected one data file and one sidecar");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_every_event_already_in_the_channel() {
        let dir = tempdir().unwrap();
        let time = TimeCache::start(0);
        let counters = Arc::new(Counters::new());
        let keys = Arc::new(KeyBuilder::new(Arc::clone(&time), "inst"));
        let fq = new_fq(dir.path(), Arc::clone(&time), Arc::clone(&keys), Arc::clone(&counters)).await;
        let uploader = Arc::new(FakeUploader::new(Mode::AlwaysSucceed));

        const N: usize = 500;
        let manager = Manager::start(
            ManagerConfig {
                channel_size: N,
                upload_queue: N,
                batch_size: 50,
                flush_interval: Duration::from_secs(60),
                raw_prefix: "raw".into(),
                dead_letter_prefix: "dead-letter".into(),
            },
            encoder(),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            fq,
            keys,
            Arc::new(Pool::new()),
            Arc::clone(&counters),
        );

        for i in 0..N {
            assert!(manager.try_push(event(&i.to_string())), "push {i} should be accepted");
        }

        manager.shutdown().await;

        assert_eq!(counters.stored_events.load(Ordering::Relaxed) as usize, N);
        assert_eq!(counters.fq_enqueued.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn encoded_batch_preserves_event_order() {
        let dir = tempdir().unwrap();
        let time = TimeCache::start(0);
        let counters = Arc::new(Counters::new());
        let keys = Arc::new(KeyBuilder::new(Arc::clone(&time), "inst"));
        let fq = new_fq(dir.path(), Arc::clone(&time), Arc::clone(&keys), Arc::clone(&counters)).await;

        struct CapturingUploader(StdMutex<Option<Bytes>>);
        #[async_trait]
        impl Uploader for CapturingUploader {
            async fn upload_bytes(
                &self,
                _cancel: &CancellationToken,
                _key: &str,
                bytes: Bytes,
            ) -> Result<(), ingest_common::UploadError> {
                *self.0.lock().unwrap() = Some(bytes);
                Ok(())
            }
            async fn upload_stream(
                &self,
                _cancel: &CancellationToken,
                _key: &str,
                _file: &mut tokio::fs::File,
                _size: u64,
            ) -> Result<(), ingest_common::UploadError> {
                Ok(())
            }
        }

        let uploader = Arc::new(CapturingUploader(StdMutex::new(None)));

        let manager = Manager::start(
            ManagerConfig {
                channel_size: 8,
                upload_queue: 8,
                batch_size: 3,
                flush_interval: Duration::from_secs(60),
                raw_prefix: "raw".into(),
                dead_letter_prefix: "dead-letter".into(),
            },
            encoder(),
            Arc::clone(&uploader) as Arc<dyn Uploader>,
            fq,
            keys,
            Arc::new(Pool::new()),
            Arc::clone(&counters),
        );

        manager.try_push(event("a"));
        manager.try_push(event("b"));
        manager.try_push(event("c"));

        for _ in 0..50 {
            if uploader.0.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let bytes = uploader.0.lock().unwrap().take().expect("batch should have been uploaded");
        assert_eq!(decode_lines(&bytes), vec!["a", "b", "c"]);

        manager.shutdown().await;
    }
}
