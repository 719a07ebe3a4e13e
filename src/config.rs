//! Type-safe configuration loader using the `config` crate,
//! with manual environment-variable overrides for core settings.

use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::{env, path::PathBuf, time::Duration};

use crate::cache::Tier;
use crate::connection::{StoreMode, TuningDirective};

/// Top-level application settings loaded from `Config.toml`
/// and then overridden (where applicable) by environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Interval between each ingestion run (e.g. "30m", "1h")
    #[serde(with = "humantime_serde")]
    pub ingest_interval: Duration,

    /// HTTP bind address for metrics & health endpoints
    pub server_bind: String,

    /// Deadline attached to every statement
    #[serde(with = "humantime_serde", default = "default_query_timeout")]
    pub query_timeout: Duration,

    pub stores: StoresSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    /// Delay applied to sources that are not listed in `sources`
    #[serde(with = "humantime_serde", default = "default_source_delay")]
    pub default_source_delay: Duration,

    /// External third-party sources and their throttle policies.
    #[serde(default)]
    pub sources: Vec<SourceSettings>,

    /// What the binary pulls on every ingestion cycle.
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoresSettings {
    pub primary: Option<StoreSettings>,
    pub moves: Option<StoreSettings>,
}

/// One logical store on disk.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub path: PathBuf,

    #[serde(default)]
    pub mode: StoreMode,

    /// A mandatory store that fails to open aborts startup.
    #[serde(default)]
    pub required: bool,

    /// Table counted once at open time for diagnostics
    #[serde(default)]
    pub count_table: Option<String>,

    /// Engine hints, applied in order, best-effort.
    #[serde(default)]
    pub tuning: Vec<TuningDirective>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default = "TierSettings::short_default")]
    pub short: TierSettings,
    #[serde(default = "TierSettings::long_default")]
    pub long: TierSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            short: TierSettings::short_default(),
            long: TierSettings::long_default(),
        }
    }
}

impl CacheSettings {
    pub fn tier(&self, tier: Tier) -> &TierSettings {
        match tier {
            Tier::Short => &self.short,
            Tier::Long => &self.long,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TierSettings {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub capacity: usize,
}

impl TierSettings {
    fn short_default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            capacity: 1024,
        }
    }

    fn long_default() -> Self {
        Self {
            ttl: Duration::from_secs(6 * 60 * 60),
            capacity: 256,
        }
    }
}

/// Represents one external source and its throttle policy.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceSettings {
    /// Identifier used by jobs and in logs (e.g. "lichess")
    pub name: String,

    /// Base URL that job paths are resolved against
    pub base_url: String,

    /// Minimum spacing between two request starts
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    pub timeout: Duration,
}

/// A recurring pull from one source.
#[derive(Debug, Deserialize, Clone)]
pub struct JobSettings {
    pub source: String,
    pub path: String,

    #[serde(default)]
    pub query: Vec<(String, String)>,

    /// JSON field holding the record's upstream identifier
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_source_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_id_field() -> String {
    "id".to_string()
}

impl Settings {
    /// Load settings from `Config.toml` (if present),
    /// then apply any overrides from these environment variables:
    ///
    /// - `APP__INGEST_INTERVAL`
    /// - `APP__SERVER_BIND`
    /// - `APP__QUERY_TIMEOUT`
    /// - `APP__PRIMARY_PATH`
    /// - `APP__MOVES_PATH`
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config")
    }

    pub fn from_file(name: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name(name).required(false))
            .build()?;

        let mut settings: Settings = cfg.try_deserialize()?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = env::var("APP__INGEST_INTERVAL") {
            self.ingest_interval = parse_duration(&val)?;
        }
        if let Ok(val) = env::var("APP__SERVER_BIND") {
            self.server_bind = val;
        }
        if let Ok(val) = env::var("APP__QUERY_TIMEOUT") {
            self.query_timeout = parse_duration(&val)?;
        }
        if let Ok(val) = env::var("APP__PRIMARY_PATH") {
            override_path(&mut self.stores.primary, val);
        }
        if let Ok(val) = env::var("APP__MOVES_PATH") {
            override_path(&mut self.stores.moves, val);
        }
        Ok(())
    }
}

fn parse_duration(val: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(val).map_err(|e| ConfigError::Foreign(Box::new(e)))
}

/// An override for an unconfigured store declares it optional and read-only.
fn override_path(store: &mut Option<StoreSettings>, path: String) {
    match store {
        Some(store) => store.path = PathBuf::from(path),
        None => {
            *store = Some(StoreSettings {
                path: PathBuf::from(path),
                mode: StoreMode::ReadOnly,
                required: false,
                count_table: None,
                tuning: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        ingest_interval = "15m"
        server_bind = "127.0.0.1:9100"

        [stores.primary]
        path = "data/records.db"
        mode = "read-write"
        required = true
        count_table = "games"
        tuning = [
            { key = "cache_size", value = "-64000" },
            { key = "temp_store", value = "MEMORY" },
        ]

        [cache.short]
        ttl = "30s"
        capacity = 16

        [[sources]]
        name = "slow"
        base_url = "http://slow.example/api/"
        min_delay = "2s"

        [[jobs]]
        source = "slow"
        path = "games"
        query = [["max", "10"]]
    "#;

    #[test]
    fn loads_sample_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Sample.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();

        let cfg = Config::builder()
            .add_source(File::from(path))
            .build()
            .unwrap();
        let settings: Settings = cfg.try_deserialize().unwrap();

        assert_eq!(settings.ingest_interval, Duration::from_secs(15 * 60));
        assert_eq!(settings.query_timeout, Duration::from_secs(30));

        let primary = settings.stores.primary.as_ref().unwrap();
        assert_eq!(primary.mode, StoreMode::ReadWrite);
        assert!(primary.required);
        assert_eq!(primary.tuning.len(), 2);
        assert_eq!(primary.tuning[0].key, "cache_size");
        assert!(settings.stores.moves.is_none());

        assert_eq!(settings.cache.short.capacity, 16);
        assert_eq!(settings.cache.long.ttl, Duration::from_secs(6 * 60 * 60));
        assert_eq!(settings.sources[0].min_delay, Duration::from_secs(2));
        assert_eq!(settings.jobs[0].id_field, "id");
        assert_eq!(settings.jobs[0].query[0], ("max".into(), "10".into()));
    }

    #[test]
    fn path_override_creates_optional_store() {
        let mut store = None;
        override_path(&mut store, "/tmp/moves.db".into());
        let store = store.unwrap();
        assert!(!store.required);
        assert_eq!(store.mode, StoreMode::ReadOnly);
    }
}
