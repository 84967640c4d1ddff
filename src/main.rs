//! Thin entrypoint: parses CLI overrides, loads configuration, wires up the
//! pipeline's shared state, and drives the HTTP server and the ordered
//! shutdown sequence. Everything that matters lives in the library crate;
//! this binary just composes it, in the split the teacher's own `vector`
//! binary uses over `vector-core`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use snafu::ResultExt;
use tracing::{debug, error, info};

use ingest_common::{BufferPool, CompressPool, Counters, KeyBuilder, Pool, TimeCache};
use ingest_queue::FailureQueue;
use ingestord::config::{Args, Config};
use ingestord::encoder::Encoder;
use ingestord::error::{AppError, BindSnafu, ConfigSnafu, FailureQueueSnafu};
use ingestord::manager::{Manager, ManagerConfig};
use ingestord::s3::{build_client, S3Uploader};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Defer full tracing initialization until config is loaded, so the log
    // level override (CLI or `LOG_LEVEL`) is honored from the first line.
    let config = match Config::load(&args).context(ConfigSnafu) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(&config.log_level, config.log_json, config.log_sample_n);
    debug!(?config, "loaded configuration");

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal startup error");
        std::process::exit(e.exit_code());
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let time = TimeCache::start(ingest_common::time_cache::DEFAULT_ZONE_OFFSET_HOURS);
    let counters = Arc::new(Counters::new());
    let keys = Arc::new(KeyBuilder::new(Arc::clone(&time), config.instance_id.clone()));
    let event_pool = Arc::new(Pool::new());

    let fq = Arc::new(
        FailureQueue::init(
            config.dlq_dir.clone(),
            config.dlq_max_size_bytes,
            config.dlq_max_age,
            Arc::clone(&counters),
            Arc::clone(&time),
            Arc::clone(&keys),
        )
        .await
        .context(FailureQueueSnafu)?,
    );

    let encoder = Arc::new(Encoder::new(CompressPool::new(), BufferPool::default()));

    let client = build_client(config.aws_region.clone()).await;
    let uploader = Arc::new(S3Uploader::new(
        client,
        config.raw_bucket.clone(),
        config.s3_timeout,
        config.s3_app_retries,
        Arc::clone(&counters),
    ));

    let manager = Manager::start(
        ManagerConfig {
            channel_size: config.channel_size,
            upload_queue: config.upload_queue,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            raw_prefix: config.raw_prefix.clone(),
            dead_letter_prefix: config.dlq_prefix.clone(),
        },
        encoder,
        uploader,
        fq,
        Arc::clone(&keys),
        Arc::clone(&event_pool),
        Arc::clone(&counters),
    );

    let routes = ingestord::http::routes(
        Arc::clone(&manager),
        Arc::clone(&event_pool),
        Arc::clone(&time),
        Arc::clone(&counters),
        config.max_body_size,
    );

    // Fail fast if the address can't be bound, rather than discovering it
    // only once the spawned server task panics.
    drop(std::net::TcpListener::bind(config.http_addr).context(BindSnafu { addr: config.http_addr })?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let addr = config.http_addr;
    let server = tokio::spawn(async move {
        ingestord::http::serve(addr, routes, async move {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    info!(%addr, "ingestord listening");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping HTTP accept loop before draining pipeline");

    // The HTTP collaborator must stop accepting (and thus stop pushing new
    // events) before we close the event channel (spec.md §4.7.3): signal its
    // graceful shutdown and wait for it to finish serving in-flight requests
    // first, then drain the pipeline.
    let _ = shutdown_tx.send(());
    if tokio::time::timeout(SHUTDOWN_DEADLINE, server).await.is_err() {
        error!("HTTP server did not stop within the shutdown deadline");
    }

    manager.shutdown().await;

    info!("ingestord exiting cleanly");
    Ok(())
}

/// `EnvFilter` composed onto the bare `Registry` — the subscriber type every
/// later layer (the formatter, optionally wrapped in `RateLimitedLayer`) is
/// threaded onto.
type FilteredRegistry = tracing_subscriber::layer::Layered<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

/// Builds the process-wide subscriber: an `EnvFilter` layer plus a formatting
/// layer (ANSI or JSON), optionally wrapped in `tracing-limit`'s
/// `RateLimitedLayer` when `LogSampleN` is set, so repeated hot-path warnings
/// (upload retries, FQ corruption/TTL/capacity events — each marked
/// `internal_log_rate_limit = true` at the call site) log at most once per
/// `log_sample_n` seconds instead of flooding (spec.md §6, `SPEC_FULL.md` A.1).
fn init_tracing(log_level: &str, log_json: bool, log_sample_n: Option<u64>) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let env_filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let base = tracing_subscriber::registry().with(env_filter);

    let fmt_layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> = if log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    match log_sample_n {
        Some(n) => {
            let limited = tracing_limit::RateLimitedLayer::new(fmt_layer).with_default_limit(n);
            base.with(limited).init();
        }
        None => {
            base.with(fmt_layer).init();
        }
    }
}

#[cfg(target_family = "unix")]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = terminate.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(target_family = "unix"))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
