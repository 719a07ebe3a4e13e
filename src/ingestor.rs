//! ingestor.rs
//!
//! Core ingestion logic: throttle per source, fetch, decode JSON or NDJSON,
//! and persist into the primary store's `ingested_records` table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::Value;
use sqlx::migrate::MigrateError;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{JobSettings, SourceSettings};
use crate::connection::{Domain, StoreHandle};
use crate::errors::IngestError;
use crate::executor::{QueryExecutor, Statement};
use crate::metrics::{FETCH_COUNTER, FETCH_FAILURES, FETCH_HISTOGRAM, RECORDS_INGESTED};
use crate::rate_limit::RateLimiter;

const INSERT_RECORD: &str = "INSERT OR IGNORE INTO ingested_records \
     (source, external_id, retrieved_at, payload) VALUES (?1, ?2, ?3, ?4)";

/// One record pulled from an external source. Lives only until it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedRecord {
    pub source: String,
    pub retrieved_at: DateTime<Utc>,
    pub external_id: Option<String>,
    pub payload: Value,
}

impl IngestedRecord {
    fn to_statement(&self) -> Statement {
        Statement::mutation(INSERT_RECORD)
            .bind(self.source.as_str())
            .bind(self.external_id.clone())
            .bind(self.retrieved_at.to_rfc3339_opts(SecondsFormat::Millis, true))
            .bind(self.payload.to_string())
    }
}

/// What to pull from a source: a path relative to its base URL plus query
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    /// JSON field holding the record's upstream identifier
    pub id_field: String,
}

impl FetchRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            id_field: "id".to_string(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }
}

impl From<&JobSettings> for FetchRequest {
    fn from(job: &JobSettings) -> Self {
        Self {
            path: job.path.clone(),
            query: job.query.clone(),
            id_field: job.id_field.clone(),
        }
    }
}

#[derive(Debug)]
struct Source {
    base_url: Url,
    client: Client,
}

/// The only component allowed to talk to external sources.
#[derive(Debug)]
pub struct IngestionClient {
    sources: HashMap<String, Source>,
    limiter: Arc<RateLimiter>,
    executor: QueryExecutor,
}

impl IngestionClient {
    pub fn new(
        sources: &[SourceSettings],
        limiter: Arc<RateLimiter>,
        executor: QueryExecutor,
    ) -> Result<Self, IngestError> {
        let mut built = HashMap::new();
        for source in sources {
            let invalid = |reason: String| IngestError::Request {
                source_id: source.name.clone(),
                reason,
            };
            let base_url = Url::parse(&source.base_url).map_err(|e| invalid(e.to_string()))?;
            let user_agent = source
                .user_agent
                .clone()
                .unwrap_or_else(|| format!("statstore/{}", env!("CARGO_PKG_VERSION")));
            let client = Client::builder()
                .user_agent(user_agent)
                .timeout(source.timeout)
                .build()
                .map_err(|e| invalid(e.to_string()))?;

            built.insert(source.name.clone(), Source { base_url, client });
        }
        Ok(Self {
            sources: built,
            limiter,
            executor,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Pull one batch from `source_id`, waiting on its throttle first.
    pub async fn fetch(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<Vec<IngestedRecord>, IngestError> {
        let source = self
            .sources
            .get(source_id)
            .ok_or_else(|| IngestError::UnknownSource(source_id.to_string()))?;
        let url = source
            .base_url
            .join(&request.path)
            .map_err(|e| IngestError::Request {
                source_id: source_id.to_string(),
                reason: e.to_string(),
            })?;

        self.limiter.acquire(source_id).await;

        FETCH_COUNTER.inc();
        let start = Instant::now();
        let result = self.fetch_body(source_id, source, url, &request.query).await;
        FETCH_HISTOGRAM.observe(start.elapsed().as_secs_f64());

        let body = result.map_err(|e| {
            FETCH_FAILURES.with_label_values(&[source_id]).inc();
            e
        })?;

        decode_records(source_id, &body, &request.id_field, Utc::now()).map_err(|error| {
            FETCH_FAILURES.with_label_values(&[source_id]).inc();
            IngestError::Decode {
                source_id: source_id.to_string(),
                error,
            }
        })
    }

    async fn fetch_body(
        &self,
        source_id: &str,
        source: &Source,
        url: Url,
        query: &[(String, String)],
    ) -> Result<Vec<u8>, IngestError> {
        let wrap = |error: reqwest::Error| IngestError::Fetch {
            source_id: source_id.to_string(),
            error,
        };
        let resp = source
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(wrap)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(IngestError::Status {
                source_id: source_id.to_string(),
                status,
            });
        }
        Ok(resp.bytes().await.map_err(wrap)?.to_vec())
    }

    /// Write records into the primary store in one transaction. Returns the
    /// number of rows inserted; records already present are skipped.
    pub async fn store(&self, source_id: &str, records: &[IngestedRecord]) -> Result<usize, IngestError> {
        if records.is_empty() {
            return Ok(0);
        }
        let stmts: Vec<Statement> = records.iter().map(IngestedRecord::to_statement).collect();
        let outcomes = self
            .executor
            .execute_batch(Domain::Primary, &stmts)
            .await
            .map_err(|error| IngestError::Store {
                source_id: source_id.to_string(),
                error,
            })?;

        let inserted = outcomes.iter().map(|o| o.rows_affected()).sum::<u64>() as usize;
        RECORDS_INGESTED
            .with_label_values(&[source_id])
            .inc_by(inserted as u64);
        Ok(inserted)
    }

    pub async fn fetch_and_store(&self, source_id: &str, request: &FetchRequest) -> Result<usize, IngestError> {
        let records = self.fetch(source_id, request).await?;
        let fetched = records.len();
        let stored = self.store(source_id, &records).await?;
        info!(
            source  = source_id,
            path    = %request.path,
            fetched = fetched,
            stored  = stored,
            "Ingested batch"
        );
        Ok(stored)
    }
}

/// Decode a response body holding a JSON array, a single JSON document, or
/// newline-delimited JSON. Top-level arrays are flattened into records.
pub fn decode_records(
    source_id: &str,
    body: &[u8],
    id_field: &str,
    retrieved_at: DateTime<Utc>,
) -> Result<Vec<IngestedRecord>, serde_json::Error> {
    let mut payloads = Vec::new();
    for value in serde_json::Deserializer::from_slice(body).into_iter::<Value>() {
        match value? {
            Value::Array(items) => payloads.extend(items),
            other => payloads.push(other),
        }
    }

    let records: Vec<IngestedRecord> = payloads
        .into_iter()
        .map(|payload| IngestedRecord {
            source: source_id.to_string(),
            retrieved_at,
            external_id: external_id(&payload, id_field),
            payload,
        })
        .collect();

    let missing = records.iter().filter(|r| r.external_id.is_none()).count();
    if missing > 0 {
        warn!(source = source_id, missing, id_field, "Records without an upstream id");
    }
    debug!(source = source_id, count = records.len(), "Decoded records");
    Ok(records)
}

fn external_id(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Create the ingestion table in a read-write store.
pub async fn migrate(handle: &StoreHandle) -> Result<(), MigrateError> {
    let mut guard = handle.lock().await;
    let conn = guard
        .as_mut()
        .ok_or_else(|| MigrateError::Execute(sqlx::Error::Protocol(format!("store `{}` is closed", handle.name()))))?;
    sqlx::migrate!("./migrations").run(conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::seed_db;
    use crate::connection::{ConnectionManager, StoreMode};
    use crate::errors::ErrorKind;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn serve() -> SocketAddr {
        let make_svc = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
                let resp = match req.uri().path() {
                    "/api/games" => Response::new(Body::from(
                        "{\"id\":\"g1\",\"speed\":\"blitz\"}\n{\"id\":\"g2\",\"speed\":\"rapid\"}\n",
                    )),
                    "/api/players" => {
                        Response::new(Body::from(r#"[{"id":1},{"id":2},{"name":"anon"}]"#))
                    }
                    "/api/echo" => Response::new(Body::from(format!(
                        "{{\"id\":\"{}\"}}",
                        req.uri().query().unwrap_or("")
                    ))),
                    "/api/broken" => Response::builder()
                        .status(StatusCode::SERVICE_UNAVAILABLE)
                        .body(Body::empty())
                        .unwrap(),
                    _ => Response::new(Body::from("not json")),
                };
                Ok::<_, Infallible>(resp)
            }))
        });
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn source(name: &str, addr: SocketAddr, delay_ms: u64) -> SourceSettings {
        SourceSettings {
            name: name.to_string(),
            base_url: format!("http://{}/api/", addr),
            min_delay: Duration::from_millis(delay_ms),
            user_agent: None,
            timeout: Duration::from_secs(5),
        }
    }

    async fn client(dir: &TempDir, migrated: bool) -> IngestionClient {
        let addr = serve().await;
        let mode = if migrated { StoreMode::ReadWrite } else { StoreMode::ReadOnly };
        let path = seed_db(dir, "records.db", 0).await;
        let handle = ConnectionManager::open("primary", &path, mode).await.unwrap();
        if migrated {
            migrate(&handle).await.unwrap();
        }
        let mut manager = ConnectionManager::new();
        manager.insert(Domain::Primary, handle);
        let executor = QueryExecutor::new(Arc::new(manager), Duration::from_secs(5));

        let sources = vec![source("a", addr, 200), source("b", addr, 20)];
        let limiter = Arc::new(RateLimiter::with_sources(
            Duration::ZERO,
            sources.iter().map(|s| (s.name.clone(), s.min_delay)),
        ));
        IngestionClient::new(&sources, limiter, executor).unwrap()
    }

    async fn stored_rows(client: &IngestionClient) -> i64 {
        client
            .executor
            .fetch_one(Domain::Primary, "SELECT COUNT(*) AS n FROM ingested_records", vec![])
            .await
            .unwrap()
            .and_then(|r| r.get_i64("n"))
            .unwrap()
    }

    #[tokio::test]
    async fn ndjson_batch_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, true).await;
        let request = FetchRequest::new("games");

        assert_eq!(client.fetch_and_store("b", &request).await.unwrap(), 2);
        assert_eq!(client.fetch_and_store("b", &request).await.unwrap(), 0);
        assert_eq!(stored_rows(&client).await, 2);
    }

    #[tokio::test]
    async fn array_body_and_query_params() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, true).await;

        let records = client.fetch("b", &FetchRequest::new("players")).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.external_id.clone()).collect();
        assert_eq!(ids, vec![Some("1".into()), Some("2".into()), None]);
        assert_eq!(client.store("b", &records).await.unwrap(), 3);

        let echoed = client
            .fetch("b", &FetchRequest::new("echo").param("max", "5"))
            .await
            .unwrap();
        assert_eq!(echoed[0].external_id.as_deref(), Some("max=5"));
        assert_eq!(echoed[0].source, "b");
    }

    #[tokio::test]
    async fn fetch_failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, true).await;

        let err = client.fetch_and_store("b", &FetchRequest::new("broken")).await.unwrap_err();
        assert!(matches!(err, IngestError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(err.kind(), ErrorKind::FetchFailure);
        assert!(err.is_retryable());

        let err = client.fetch_and_store("b", &FetchRequest::new("garbage")).await.unwrap_err();
        assert!(matches!(err, IngestError::Decode { .. }));
        assert_eq!(err.kind(), ErrorKind::FetchFailure);

        let err = client.fetch_and_store("nope", &FetchRequest::new("games")).await.unwrap_err();
        assert!(matches!(err, IngestError::UnknownSource(_)));
        assert!(!err.is_retryable());

        assert_eq!(stored_rows(&client).await, 0);
    }

    #[tokio::test]
    async fn persistence_failure_is_a_store_failure() {
        let dir = tempfile::tempdir().unwrap();
        // read-only and never migrated
        let client = client(&dir, false).await;

        let err = client.fetch_and_store("b", &FetchRequest::new("games")).await.unwrap_err();
        assert!(matches!(err, IngestError::Store { .. }));
        assert_eq!(err.kind(), ErrorKind::StoreFailure);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn requests_to_one_source_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, true).await;
        let request = FetchRequest::new("games");

        let start = Instant::now();
        for _ in 0..3 {
            client.fetch("a", &request).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn decodes_single_document_and_numeric_ids() {
        let now = Utc::now();
        let pretty = b"{\n  \"gameId\": 42,\n  \"moves\": \"e4 e5\"\n}\n";
        let records = decode_records("s", pretty, "gameId", now).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id.as_deref(), Some("42"));
        assert_eq!(records[0].retrieved_at, now);

        assert!(decode_records("s", b"", "id", now).unwrap().is_empty());
        assert!(decode_records("s", b"{\"id\":1}\n{oops", "id", now).is_err());
    }
}
