//! Entrypoint: set up tracing, open and tune the stores, start the HTTP
//! metrics & health server, and run the ingestion loop.
//!
//! This application uses a strongly-typed configuration (`Settings`) defined in `config.rs`,
//! which provides:
//!  - `stores`             – primary and move-indexed SQLite stores, with tuning
//!  - `cache`              – short and long tier TTLs and capacities
//!  - `sources`            – external sources and their minimum request spacing
//!  - `jobs`               – what to pull from each source every `ingest_interval`

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use statstore::config::Settings;
use statstore::connection::{ConnectionManager, Domain, StoreMode};
use statstore::errors::AppError;
use statstore::executor::QueryExecutor;
use statstore::ingestor::{self, FetchRequest, IngestionClient};
use statstore::metrics;
use statstore::rate_limit::RateLimiter;
use statstore::stats::{ResultCache, StatsReader};

/// Application entrypoint.
///
/// **Workflow**:
/// 1. Initialise tracing/logging from `RUST_LOG` (or default to `info`).
/// 2. Load `Config.toml` (and apply any `APP__…` env-var overrides).
/// 3. Open both stores; run migrations on a writable primary store.
/// 4. Build the cache, executor, rate limiter and ingestion client.
/// 5. Launch a background HTTP server on `/metrics` and `/healthz`.
/// 6. Run every configured job each `ingest_interval` until Ctrl-C, then
///    close the stores.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ───────────────────────────────────────────────────────────────
    // 1. Initialise tracing / logging
    // ───────────────────────────────────────────────────────────────
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting statstore…");

    // ───────────────────────────────────────────────────────────────
    // 2. Load configuration
    // ───────────────────────────────────────────────────────────────
    let settings = Settings::new().map_err(AppError::from)?;
    info!(?settings, "Loaded configuration");

    // ───────────────────────────────────────────────────────────────
    // 3. Stores & migrations
    // ───────────────────────────────────────────────────────────────
    let connections = ConnectionManager::open_all(&settings.stores)
        .await
        .map_err(AppError::from)?;

    if let Ok(primary) = connections.store(Domain::Primary) {
        if primary.mode() == StoreMode::ReadWrite {
            info!("Running database migrations…");
            ingestor::migrate(&primary).await.map_err(AppError::from)?;
            info!("Migrations complete");
        }
    }
    for domain in Domain::ALL {
        if !connections.is_available(domain) {
            warn!(domain = domain.as_str(), "Queries for this domain will report StoreUnavailable");
        }
    }
    let connections = Arc::new(connections);

    // ───────────────────────────────────────────────────────────────
    // 4. Core components
    // ───────────────────────────────────────────────────────────────
    let executor = QueryExecutor::new(connections.clone(), settings.query_timeout);
    let cache = Arc::new(ResultCache::from_settings(&settings.cache));
    let reader = Arc::new(StatsReader::new(cache, executor.clone()));

    let limiter = Arc::new(RateLimiter::with_sources(
        settings.default_source_delay,
        settings.sources.iter().map(|s| (s.name.clone(), s.min_delay)),
    ));
    let client = Arc::new(
        IngestionClient::new(&settings.sources, limiter, executor)
            .context("Invalid source configuration")?,
    );

    // ───────────────────────────────────────────────────────────────
    // 5. HTTP server for metrics & health
    // ───────────────────────────────────────────────────────────────
    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .context("Invalid `server_bind` in configuration")?;

    let make_svc = {
        let reader = reader.clone();
        let connections = connections.clone();
        make_service_fn(move |_conn| {
            let reader = reader.clone();
            let connections = connections.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let reader = reader.clone();
                    let connections = connections.clone();
                    async move { Ok::<_, Infallible>(route(req, &reader, &connections)) }
                }))
            }
        })
    };

    tokio::spawn(async move {
        info!(%addr, "Starting metrics & health server");
        if let Err(e) = Server::bind(&addr).serve(make_svc).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    // ───────────────────────────────────────────────────────────────
    // 6. Ingestion loop
    // ───────────────────────────────────────────────────────────────
    let jobs = Arc::new(settings.jobs.clone());
    let mut ticker = interval(settings.ingest_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }

        let cycle_start = Instant::now();
        info!("Starting ingestion cycle for {} jobs", jobs.len());

        let mut tasks = FuturesUnordered::new();
        for job in jobs.iter() {
            let client = client.clone();
            tasks.push(async move {
                let request = FetchRequest::from(job);
                match client.fetch_and_store(&job.source, &request).await {
                    Ok(stored) => (stored, 0),
                    Err(e) => {
                        error!(
                            source    = %job.source,
                            path      = %job.path,
                            error     = %e,
                            kind      = ?e.kind(),
                            retryable = e.is_retryable(),
                            "Ingestion job failed"
                        );
                        (0, 1)
                    }
                }
            });
        }

        let mut total_stored = 0;
        let mut total_errors = 0;
        while let Some((stored, errs)) = tasks.next().await {
            total_stored += stored;
            total_errors += errs;
        }

        info!(
            total_jobs   = jobs.len(),
            total_stored = total_stored,
            total_errors = total_errors,
            cycle_s      = cycle_start.elapsed().as_secs_f64(),
            "Ingestion cycle complete"
        );
    }

    connections.shutdown().await;
    info!("Stores closed");
    Ok(())
}

fn route(req: Request<Body>, reader: &StatsReader, connections: &ConnectionManager) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        // Prometheus (v3+) rejects a scrape without the text-format MIME type
        (&Method::GET, "/metrics") => {
            metrics::record_cache_stats(&reader.cache_stats());
            let body = metrics::gather_metrics();
            let mut resp = Response::new(Body::from(body));
            if let Ok(mime) = TextEncoder::new().format_type().parse() {
                resp.headers_mut().insert(hyper::header::CONTENT_TYPE, mime);
            }
            resp
        }

        (&Method::GET, "/healthz") => {
            let mut resp = Response::new(Body::from("OK"));
            if !connections.is_available(Domain::Primary) {
                *resp.body_mut() = Body::from("primary store unavailable");
                *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            }
            resp
        }

        _ => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    }
}
