//! Cached read path for aggregate statistics: cache first, then the store
//! serving the query's domain, then back into the caller's chosen tier.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheLookup, CacheTierManager, CacheTierStats, Fingerprint, Tier};
use crate::connection::Domain;
use crate::errors::QueryError;
use crate::executor::{Operation, QueryExecutor, QueryOutcome, Statement};

pub type ResultCache = CacheTierManager<Arc<QueryOutcome>>;

/// Whether a result came from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    Hit,
    Miss,
}

#[derive(Clone)]
pub struct StatsReader {
    cache: Arc<ResultCache>,
    executor: QueryExecutor,
}

impl StatsReader {
    pub fn new(cache: Arc<ResultCache>, executor: QueryExecutor) -> Self {
        Self { cache, executor }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Serve a read from the cache, or run it and cache the result in `tier`.
    /// Failures are never cached. Non-read statements bypass the cache.
    ///
    /// Concurrent misses on one key each run the statement; the last `put`
    /// wins. A cached result may be stale until its TTL or an invalidation.
    pub async fn fetch(
        &self,
        key: Fingerprint,
        tier: Tier,
        domain: Domain,
        stmt: &Statement,
    ) -> Result<(Arc<QueryOutcome>, Served), QueryError> {
        if !matches!(stmt.op, Operation::ReadOne | Operation::ReadMany) {
            let outcome = self.executor.execute(domain, stmt).await?;
            return Ok((Arc::new(outcome), Served::Miss));
        }

        self.cache.assign(key.query_id(), tier);
        if let CacheLookup::Hit(value) = self.cache.get(&key) {
            return Ok((value, Served::Hit));
        }

        let outcome = Arc::new(self.executor.execute(domain, stmt).await?);
        debug!(key = %key, tier = tier.as_str(), domain = domain.as_str(), "Caching query result");
        self.cache.put(key, outcome.clone(), tier);
        Ok((outcome, Served::Miss))
    }

    /// Run a mutation and drop cached results of the listed query classes.
    pub async fn write(
        &self,
        domain: Domain,
        stmt: &Statement,
        invalidates: &[&str],
    ) -> Result<QueryOutcome, QueryError> {
        let outcome = self.executor.execute(domain, stmt).await?;
        for query_id in invalidates {
            self.cache.invalidate_query(query_id);
        }
        Ok(outcome)
    }

    pub fn cache_stats(&self) -> Vec<CacheTierStats> {
        self.cache.all_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::seed_db;
    use crate::connection::{ConnectionManager, StoreMode};
    use std::time::Duration;

    async fn reader(path: &std::path::Path, mode: StoreMode) -> StatsReader {
        let mut manager = ConnectionManager::new();
        manager.insert(
            Domain::Primary,
            ConnectionManager::open("primary", path, mode).await.unwrap(),
        );
        let executor = QueryExecutor::new(Arc::new(manager), Duration::from_secs(5));
        let cache = Arc::new(ResultCache::new(
            Duration::from_secs(60),
            16,
            Duration::from_secs(3600),
            16,
        ));
        StatsReader::new(cache, executor)
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 6).await;
        let reader = reader(&path, StoreMode::ReadOnly).await;

        let stmt = Statement::read_one("SELECT COUNT(*) AS n FROM games WHERE speed = ?1").bind("blitz");
        let key = Fingerprint::new("count", ["blitz"]);

        let (first, served) = reader.fetch(key.clone(), Tier::Short, Domain::Primary, &stmt).await.unwrap();
        assert_eq!(served, Served::Miss);
        let (second, served) = reader.fetch(key, Tier::Short, Domain::Primary, &stmt).await.unwrap();
        assert_eq!(served, Served::Hit);
        assert_eq!(first, second);
        assert_eq!(second.rows()[0].get_i64("n"), Some(3));
    }

    #[tokio::test]
    async fn long_tier_reads_are_counted_in_the_long_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 4).await;
        let reader = reader(&path, StoreMode::ReadOnly).await;

        let stmt = Statement::read_one("SELECT MAX(rating) AS best FROM games");
        let key = Fingerprint::new("best", Vec::<&str>::new());
        for _ in 0..2 {
            reader.fetch(key.clone(), Tier::Long, Domain::Primary, &stmt).await.unwrap();
        }

        let long = reader.cache().stats(Tier::Long);
        assert_eq!((long.hits, long.misses), (1, 1));
        assert_eq!(long.hit_rate, 0.5);
        let short = reader.cache().stats(Tier::Short);
        assert_eq!((short.hits, short.misses, short.entries), (0, 0, 0));
    }

    #[tokio::test]
    async fn unavailable_domain_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 1).await;
        let reader = reader(&path, StoreMode::ReadOnly).await;

        let key = Fingerprint::new("moves", ["e4"]);
        let stmt = Statement::read_many("SELECT 1");
        for _ in 0..2 {
            let err = reader.fetch(key.clone(), Tier::Long, Domain::Moves, &stmt).await.unwrap_err();
            assert!(matches!(err, QueryError::StoreUnavailable(Domain::Moves)));
        }
        assert_eq!(reader.cache().stats(Tier::Long).entries, 0);
    }

    #[tokio::test]
    async fn write_invalidates_listed_classes() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, "records.db", 2).await;
        let reader = reader(&path, StoreMode::ReadWrite).await;

        let stmt = Statement::read_one("SELECT COUNT(*) AS n FROM games");
        let key = Fingerprint::new("total", Vec::<&str>::new());
        reader.fetch(key.clone(), Tier::Long, Domain::Primary, &stmt).await.unwrap();

        let insert = Statement::mutation("INSERT INTO games (speed, rating) VALUES ('blitz', 1)");
        assert_eq!(reader.write(Domain::Primary, &insert, &["total"]).await.unwrap().rows_affected(), 1);

        let (fresh, served) = reader.fetch(key, Tier::Long, Domain::Primary, &stmt).await.unwrap();
        assert_eq!(served, Served::Miss);
        assert_eq!(fresh.rows()[0].get_i64("n"), Some(3));
    }
}
