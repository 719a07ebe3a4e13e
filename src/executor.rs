//! executor.rs
//!
//! Uniform request/result contract over a store. The caller says what kind
//! of statement it is issuing; nothing here inspects SQL text to decide.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Row as _, Sqlite, TypeInfo, ValueRef};
use tracing::{debug, warn};

use crate::connection::{ConnectionManager, Domain, StoreHandle};
use crate::errors::QueryError;
use crate::metrics::{QUERY_COUNTER, QUERY_FAILURES, QUERY_HISTOGRAM};

/// A single SQLite value, used both for bound parameters and for results.
#[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One result row with its column order preserved.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        match self.get(column)? {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn from_sqlite(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let mut out = Row::default();
        for (i, column) in row.columns().iter().enumerate() {
            let raw = row.try_get_raw(i)?;
            let value = if raw.is_null() {
                SqlValue::Null
            } else {
                let type_name = raw.type_info().name().to_owned();
                match type_name.as_str() {
                    "INTEGER" => SqlValue::Integer(row.try_get(i)?),
                    "REAL" => SqlValue::Real(row.try_get(i)?),
                    "BLOB" => SqlValue::Blob(row.try_get(i)?),
                    _ => SqlValue::Text(row.try_get(i)?),
                }
            };
            out.columns.push(column.name().to_string());
            out.values.push(value);
        }
        Ok(out)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// What the caller intends a statement to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Engine-level hint; failures are logged and swallowed.
    Tuning,
    /// insert/update/delete
    Mutation,
    /// Zero or one row
    ReadOne,
    /// Ordered sequence of rows
    ReadMany,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Tuning => "tuning",
            Operation::Mutation => "mutation",
            Operation::ReadOne => "read_one",
            Operation::ReadMany => "read_many",
        }
    }
}

/// A statement plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub op: Operation,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(op: Operation, sql: impl Into<String>) -> Self {
        Self {
            op,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn tuning(sql: impl Into<String>) -> Self {
        Self::new(Operation::Tuning, sql)
    }

    pub fn mutation(sql: impl Into<String>) -> Self {
        Self::new(Operation::Mutation, sql)
    }

    pub fn read_one(sql: impl Into<String>) -> Self {
        Self::new(Operation::ReadOne, sql)
    }

    pub fn read_many(sql: impl Into<String>) -> Self {
        Self::new(Operation::ReadMany, sql)
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Result of a statement, shaped by its [`Operation`].
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    Tuned { applied: bool },
    Mutated { rows_affected: u64, last_insert_id: i64 },
    Row { row: Option<Row> },
    Rows { rows: Vec<Row> },
}

impl QueryOutcome {
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryOutcome::Rows { rows } => rows,
            QueryOutcome::Row { row: Some(row) } => std::slice::from_ref(row),
            _ => &[],
        }
    }

    pub fn rows_affected(&self) -> u64 {
        match self {
            QueryOutcome::Mutated { rows_affected, .. } => *rows_affected,
            _ => 0,
        }
    }
}

/// Executes statements against the store serving a domain, one at a time per
/// store, each under a deadline.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    connections: Arc<ConnectionManager>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(connections: Arc<ConnectionManager>, timeout: Duration) -> Self {
        Self {
            connections,
            timeout,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `stmt` against the store for `domain`. A missing store is reported
    /// as `StoreUnavailable` without touching any connection.
    pub async fn execute(&self, domain: Domain, stmt: &Statement) -> Result<QueryOutcome, QueryError> {
        let handle = self.connections.store(domain)?;
        self.execute_on(&handle, stmt).await
    }

    pub async fn execute_on(&self, handle: &StoreHandle, stmt: &Statement) -> Result<QueryOutcome, QueryError> {
        QUERY_COUNTER
            .with_label_values(&[handle.name(), stmt.op.as_str()])
            .inc();
        let start = Instant::now();

        // The deadline covers waiting for the store lock as well as the
        // statement itself. On expiry the future is dropped and the lock freed,
        // but a statement already on the SQLite worker runs to completion and
        // the next statement on this connection queues behind it.
        let result = match tokio::time::timeout(self.timeout, run_locked(handle, stmt)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout {
                store: handle.name().to_string(),
                after: self.timeout,
            }),
        };
        QUERY_HISTOGRAM.observe(start.elapsed().as_secs_f64());

        match result {
            Err(e) if stmt.op == Operation::Tuning => {
                warn!(store = handle.name(), sql = %stmt.sql, error = %e, "Tuning statement not issued");
                Ok(QueryOutcome::Tuned { applied: false })
            }
            Err(e) => {
                QUERY_FAILURES.with_label_values(&[handle.name()]).inc();
                debug!(store = handle.name(), op = stmt.op.as_str(), error = %e, "Statement failed");
                Err(e)
            }
            ok => ok,
        }
    }

    /// Run a batch of statements in one transaction under a single
    /// acquisition of the store lock, so nothing interleaves with them. The
    /// first failure rolls the whole batch back.
    pub async fn execute_batch(
        &self,
        domain: Domain,
        stmts: &[Statement],
    ) -> Result<Vec<QueryOutcome>, QueryError> {
        let handle = self.connections.store(domain)?;
        for stmt in stmts {
            QUERY_COUNTER
                .with_label_values(&[handle.name(), stmt.op.as_str()])
                .inc();
        }
        let start = Instant::now();
        let wrap = |source: sqlx::Error| QueryError::Statement {
            store: handle.name().to_string(),
            source,
        };
        let run = async {
            let mut guard = handle.lock().await;
            let conn = guard.as_mut().ok_or_else(|| QueryError::Closed {
                store: handle.name().to_string(),
            })?;
            let mut tx = conn.begin().await.map_err(wrap)?;
            let mut out = Vec::with_capacity(stmts.len());
            for stmt in stmts {
                out.push(run_statement(&mut tx, handle.name(), stmt).await?);
            }
            tx.commit().await.map_err(wrap)?;
            Ok::<_, QueryError>(out)
        };
        let result = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout {
                store: handle.name().to_string(),
                after: self.timeout,
            }),
        };
        QUERY_HISTOGRAM.observe(start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            QUERY_FAILURES.with_label_values(&[handle.name()]).inc();
            debug!(store = handle.name(), statements = stmts.len(), error = %e, "Batch rolled back");
        }
        result
    }

    pub async fn fetch_one(&self, domain: Domain, sql: &str, params: Vec<SqlValue>) -> Result<Option<Row>, QueryError> {
        let stmt = Statement {
            op: Operation::ReadOne,
            sql: sql.to_string(),
            params,
        };
        match self.execute(domain, &stmt).await? {
            QueryOutcome::Row { row } => Ok(row),
            other => Ok(other.rows().first().cloned()),
        }
    }

    pub async fn fetch_all(&self, domain: Domain, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>, QueryError> {
        let stmt = Statement {
            op: Operation::ReadMany,
            sql: sql.to_string(),
            params,
        };
        Ok(self.execute(domain, &stmt).await?.rows().to_vec())
    }

    /// Returns `(rows_affected, last_insert_id)`.
    pub async fn mutate(&self, domain: Domain, sql: &str, params: Vec<SqlValue>) -> Result<(u64, i64), QueryError> {
        let stmt = Statement {
            op: Operation::Mutation,
            sql: sql.to_string(),
            params,
        };
        match self.execute(domain, &stmt).await? {
            QueryOutcome::Mutated {
                rows_affected,
                last_insert_id,
            } => Ok((rows_affected, last_insert_id)),
            _ => Ok((0, 0)),
        }
    }

    /// Fire-and-forget engine hint. Never fails once the store exists.
    pub async fn tune(&self, domain: Domain, sql: &str) -> Result<bool, QueryError> {
        match self.execute(domain, &Statement::tuning(sql)).await? {
            QueryOutcome::Tuned { applied } => Ok(applied),
            _ => Ok(true),
        }
    }
}

async fn run_locked(handle: &StoreHandle, stmt: &Statement) -> Result<QueryOutcome, QueryError> {
    let mut guard = handle.lock().await;
    let conn = guard.as_mut().ok_or_else(|| QueryError::Closed {
        store: handle.name().to_string(),
    })?;
    run_statement(conn, handle.name(), stmt).await
}

async fn run_statement(
    conn: &mut SqliteConnection,
    store: &str,
    stmt: &Statement,
) -> Result<QueryOutcome, QueryError> {
    let wrap = |source: sqlx::Error| QueryError::Statement {
        store: store.to_string(),
        source,
    };
    let query = bind_all(sqlx::query(&stmt.sql), &stmt.params);

    match stmt.op {
        Operation::Tuning => match query.execute(&mut *conn).await {
            Ok(_) => Ok(QueryOutcome::Tuned { applied: true }),
            Err(e) => {
                warn!(store, sql = %stmt.sql, error = %e, "Tuning statement rejected");
                Ok(QueryOutcome::Tuned { applied: false })
            }
        },
        Operation::Mutation => {
            let done = query.execute(&mut *conn).await.map_err(wrap)?;
            Ok(QueryOutcome::Mutated {
                rows_affected: done.rows_affected(),
                last_insert_id: done.last_insert_rowid(),
            })
        }
        Operation::ReadOne => {
            let row = query.fetch_optional(&mut *conn).await.map_err(wrap)?;
            let row = row.as_ref().map(Row::from_sqlite).transpose().map_err(wrap)?;
            Ok(QueryOutcome::Row { row })
        }
        Operation::ReadMany => {
            let rows = query.fetch_all(&mut *conn).await.map_err(wrap)?;
            let rows = rows
                .iter()
                .map(Row::from_sqlite)
                .collect::<Result<Vec<_>, _>>()
                .map_err(wrap)?;
            Ok(QueryOutcome::Rows { rows })
        }
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Blob(v) => query.bind(v.as_slice()),
        };
    }
    query
}
