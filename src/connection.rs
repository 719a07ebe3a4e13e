//! connection.rs
//!
//! Opens and tunes the two logical SQLite stores. Each store is held as a
//! single connection behind an async mutex, so statements against one store
//! run one at a time and in the order they were issued.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::{StoreSettings, StoresSettings};
use crate::errors::{OpenError, QueryError, TuningError};

/// Which logical dataset a query belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    /// Canonical record store
    Primary,
    /// Larger move-indexed store
    Moves,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Primary, Domain::Moves];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Primary => "primary",
            Domain::Moves => "moves",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::ReadOnly => "read-only",
            StoreMode::ReadWrite => "read-write",
        }
    }
}

/// An engine hint such as `cache_size = -64000`, issued as a PRAGMA.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct TuningDirective {
    pub key: String,
    pub value: String,
}

impl TuningDirective {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Render as a PRAGMA, refusing anything that is not a plain identifier
    /// or literal so a directive can never smuggle in a second statement.
    pub fn to_pragma(&self) -> Result<String, TuningError> {
        let key_ok = !self.key.is_empty()
            && self
                .key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        let value_ok = !self.value.is_empty()
            && self
                .value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

        if key_ok && value_ok {
            Ok(format!("PRAGMA {} = {}", self.key, self.value))
        } else {
            Err(TuningError::InvalidDirective {
                key: self.key.clone(),
                value: self.value.clone(),
            })
        }
    }
}

impl fmt::Display for TuningDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// An opened store. Owned by [`ConnectionManager`]; everyone else borrows it
/// through an `Arc`.
pub struct StoreHandle {
    name: String,
    path: PathBuf,
    mode: StoreMode,
    live: AtomicBool,
    applied: parking_lot::RwLock<BTreeSet<TuningDirective>>,
    record_count: parking_lot::RwLock<Option<i64>>,
    conn: Mutex<Option<SqliteConnection>>,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("live", &self.is_live())
            .field("record_count", &self.record_count())
            .finish()
    }
}

impl StoreHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Directives the engine accepted at open time.
    pub fn applied_tuning(&self) -> BTreeSet<TuningDirective> {
        self.applied.read().clone()
    }

    /// Snapshot taken by [`ConnectionManager::record_count`], if any.
    pub fn record_count(&self) -> Option<i64> {
        *self.record_count.read()
    }

    /// Take the store's serialization lock. `None` inside the guard means the
    /// store has been closed.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<SqliteConnection>> {
        self.conn.lock().await
    }
}

/// Owner of every open [`StoreHandle`], keyed by domain.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    stores: HashMap<Domain, Arc<StoreHandle>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store without tuning it. Fails with `NotFound` when the file
    /// does not exist and with `Engine` when it is not a readable database;
    /// stores are never created here.
    pub async fn open(
        name: &str,
        path: impl AsRef<Path>,
        mode: StoreMode,
    ) -> Result<StoreHandle, OpenError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OpenError::NotFound {
                name: name.to_string(),
                path: path.to_path_buf(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .read_only(mode == StoreMode::ReadOnly);

        let engine = |source| OpenError::Engine {
            name: name.to_string(),
            source,
        };
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(engine)?;

        // SQLite reads the header lazily; a file that is not a database only
        // fails on first access.
        sqlx::query_scalar::<_, i64>("PRAGMA schema_version")
            .fetch_one(&mut conn)
            .await
            .map_err(engine)?;

        debug!(store = name, path = %path.display(), mode = mode.as_str(), "Connection established");

        Ok(StoreHandle {
            name: name.to_string(),
            path: path.to_path_buf(),
            mode,
            live: AtomicBool::new(true),
            applied: parking_lot::RwLock::new(BTreeSet::new()),
            record_count: parking_lot::RwLock::new(None),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Apply each directive independently. Rejections are logged and skipped;
    /// the store stays usable whatever happens here. Returns how many were
    /// applied.
    pub async fn apply_tuning(handle: &StoreHandle, directives: &[TuningDirective]) -> usize {
        let mut guard = handle.lock().await;
        let Some(conn) = guard.as_mut() else {
            warn!(store = handle.name(), "Skipping tuning on a closed store");
            return 0;
        };

        let mut applied = 0;
        for directive in directives {
            match apply_one(conn, directive).await {
                Ok(()) => {
                    handle.applied.write().insert(directive.clone());
                    applied += 1;
                }
                Err(e) => {
                    warn!(
                        store     = handle.name(),
                        directive = %directive,
                        error     = %e,
                        "Tuning directive not applied"
                    );
                }
            }
        }
        applied
    }

    /// Count rows in `table` and remember the figure on the handle. Only used
    /// for startup diagnostics.
    pub async fn record_count(handle: &StoreHandle, table: &str) -> Result<i64, QueryError> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));

        let mut guard = handle.lock().await;
        let conn = guard.as_mut().ok_or_else(|| QueryError::Closed {
            store: handle.name().to_string(),
        })?;

        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(|source| QueryError::Statement {
                store: handle.name().to_string(),
                source,
            })?;

        *handle.record_count.write() = Some(count);
        Ok(count)
    }

    /// Release the connection. Idempotent; failures are logged only.
    pub async fn close(handle: &StoreHandle) {
        let taken = handle.lock().await.take();
        handle.live.store(false, Ordering::Release);

        if let Some(conn) = taken {
            match conn.close().await {
                Ok(()) => info!(store = handle.name(), "Store closed"),
                Err(e) => error!(store = handle.name(), error = %e, "Failed to close store"),
            }
        }
    }

    /// Open, tune and count one configured store. `Ok(None)` means an optional
    /// store is absent.
    pub async fn open_configured(
        name: &str,
        settings: &StoreSettings,
    ) -> Result<Option<StoreHandle>, OpenError> {
        let handle = match Self::open(name, &settings.path, settings.mode).await {
            Ok(handle) => handle,
            Err(e) if e.is_absent() && !settings.required => {
                info!(store = name, path = %settings.path.display(), "Store absent, continuing without it");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let applied = Self::apply_tuning(&handle, &settings.tuning).await;

        if let Some(table) = &settings.count_table {
            if let Err(e) = Self::record_count(&handle, table).await {
                warn!(store = name, table = %table, error = %e, "Record count failed");
            }
        }

        info!(
            store   = name,
            mode    = handle.mode().as_str(),
            path    = %handle.path().display(),
            records = ?handle.record_count(),
            tuning  = %format!("{}/{}", applied, settings.tuning.len()),
            "Opened store"
        );

        Ok(Some(handle))
    }

    /// Open both configured stores. Only a missing or broken mandatory store
    /// is an error.
    pub async fn open_all(settings: &StoresSettings) -> Result<Self, OpenError> {
        let mut manager = Self::new();
        for (domain, store) in [
            (Domain::Primary, &settings.primary),
            (Domain::Moves, &settings.moves),
        ] {
            let Some(store) = store else {
                info!(store = domain.as_str(), "Store not configured");
                continue;
            };
            match Self::open_configured(domain.as_str(), store).await {
                Ok(Some(handle)) => manager.insert(domain, handle),
                Ok(None) => {}
                Err(e) if !store.required => {
                    warn!(store = domain.as_str(), error = %e, "Optional store failed to open");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(manager)
    }

    pub fn insert(&mut self, domain: Domain, handle: StoreHandle) {
        self.stores.insert(domain, Arc::new(handle));
    }

    /// The store serving `domain`, or `StoreUnavailable` when it never opened
    /// or has been shut down.
    pub fn store(&self, domain: Domain) -> Result<Arc<StoreHandle>, QueryError> {
        self.stores
            .get(&domain)
            .filter(|h| h.is_live())
            .cloned()
            .ok_or(QueryError::StoreUnavailable(domain))
    }

    pub fn is_available(&self, domain: Domain) -> bool {
        self.store(domain).is_ok()
    }

    /// Close every store, best-effort.
    pub async fn shutdown(&self) {
        for handle in self.stores.values() {
            Self::close(handle).await;
        }
    }
}

async fn apply_one(
    conn: &mut SqliteConnection,
    directive: &TuningDirective,
) -> Result<(), TuningError> {
    let pragma = directive.to_pragma()?;
    sqlx::query(&pragma)
        .execute(&mut *conn)
        .await
        .map(|_| ())
        .map_err(|source| TuningError::Rejected {
            key: directive.key.clone(),
            value: directive.value.clone(),
            source,
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use tempfile::TempDir;

    /// Create a database with a `games` table holding `rows` rows.
    pub(crate) async fn seed_db(dir: &TempDir, file: &str, rows: i64) -> PathBuf {
        let path = dir.path().join(file);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query("CREATE TABLE games (id INTEGER PRIMARY KEY, speed TEXT NOT NULL, rating INTEGER)")
            .execute(&mut conn)
            .await
            .unwrap();
        for i in 0..rows {
            let speed = if i % 2 == 0 { "blitz" } else { "rapid" };
            sqlx::query("INSERT INTO games (speed, rating) VALUES (?1, ?2)")
                .bind(speed)
                .bind(1500 + i)
                .execute(&mut conn)
                .await
                .unwrap();
        }
        conn.close().await.unwrap();
        path
    }

    #[tokio::test]
    async fn open_missing_store_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConnectionManager::open("moves", dir.path().join("absent.db"), StoreMode::ReadOnly)
            .await
            .unwrap_err();
        assert!(err.is_absent());
        assert!(!dir.path().join("absent.db").exists());
    }

    #[tokio::test]
    async fn record_count_reports_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 10).await;

        let handle = ConnectionManager::open("primary", &path, StoreMode::ReadOnly)
            .await
            .unwrap();
        assert_eq!(handle.record_count(), None);
        assert_eq!(ConnectionManager::record_count(&handle, "games").await.unwrap(), 10);
        assert_eq!(handle.record_count(), Some(10));
    }

    #[tokio::test]
    async fn rejected_tuning_leaves_store_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 3).await;
        let handle = ConnectionManager::open("primary", &path, StoreMode::ReadOnly)
            .await
            .unwrap();

        let directives = vec![
            TuningDirective::new("cache_size", "-2000"),
            // needs write access on a read-only store
            TuningDirective::new("user_version", "7"),
            TuningDirective::new("temp_store", "MEMORY; DROP TABLE games"),
            TuningDirective::new("mmap_size", "268435456"),
        ];
        let applied = ConnectionManager::apply_tuning(&handle, &directives).await;

        assert_eq!(applied, 2);
        let set = handle.applied_tuning();
        assert!(set.contains(&directives[0]));
        assert!(set.contains(&directives[3]));
        assert!(!set.contains(&directives[1]));
        assert_eq!(ConnectionManager::record_count(&handle, "games").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_marks_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 1).await;
        let mut manager = ConnectionManager::new();
        manager.insert(
            Domain::Primary,
            ConnectionManager::open("primary", &path, StoreMode::ReadOnly)
                .await
                .unwrap(),
        );

        let handle = manager.store(Domain::Primary).unwrap();
        ConnectionManager::close(&handle).await;
        ConnectionManager::close(&handle).await;

        assert!(!handle.is_live());
        assert!(matches!(
            manager.store(Domain::Primary),
            Err(QueryError::StoreUnavailable(Domain::Primary))
        ));
        assert!(matches!(
            ConnectionManager::record_count(&handle, "games").await,
            Err(QueryError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn open_all_skips_absent_optional_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 10).await;
        let settings = StoresSettings {
            primary: Some(StoreSettings {
                path,
                mode: StoreMode::ReadOnly,
                required: true,
                count_table: Some("games".into()),
                tuning: vec![TuningDirective::new("cache_size", "-2000")],
            }),
            moves: Some(StoreSettings {
                path: dir.path().join("moves.db"),
                mode: StoreMode::ReadOnly,
                required: false,
                count_table: None,
                tuning: Vec::new(),
            }),
        };

        let manager = ConnectionManager::open_all(&settings).await.unwrap();
        assert_eq!(manager.store(Domain::Primary).unwrap().record_count(), Some(10));
        assert!(!manager.is_available(Domain::Moves));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn open_all_fails_for_missing_mandatory_store() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StoresSettings {
            primary: Some(StoreSettings {
                path: dir.path().join("records.db"),
                mode: StoreMode::ReadOnly,
                required: true,
                count_table: None,
                tuning: Vec::new(),
            }),
            moves: None,
        };
        let err = ConnectionManager::open_all(&settings).await.unwrap_err();
        assert!(err.is_absent());
    }

    #[tokio::test]
    async fn file_that_is_not_a_database_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        std::fs::write(&path, "this is a plain text file, not an sqlite database\n".repeat(20)).unwrap();

        let err = ConnectionManager::open("primary", &path, StoreMode::ReadOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, OpenError::Engine { .. }));
        assert!(!err.is_absent());

        let settings = StoresSettings {
            primary: Some(StoreSettings {
                path: path.clone(),
                mode: StoreMode::ReadOnly,
                required: true,
                count_table: None,
                tuning: Vec::new(),
            }),
            moves: None,
        };
        let err = ConnectionManager::open_all(&settings).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::OpenFailure);

        let settings = StoresSettings {
            primary: None,
            moves: Some(StoreSettings {
                path,
                mode: StoreMode::ReadOnly,
                required: false,
                count_table: None,
                tuning: Vec::new(),
            }),
        };
        let manager = ConnectionManager::open_all(&settings).await.unwrap();
        assert!(!manager.is_available(Domain::Moves));
    }
}
