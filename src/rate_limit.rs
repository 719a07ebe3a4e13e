//! Per-source fixed-delay throttle for outbound requests.
//!
//! Each source keeps the start time of its last permitted request. A caller
//! is suspended until `last + min_delay`, then becomes the new `last`. There
//! is no burst allowance. Sources never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::metrics::RATE_LIMIT_WAIT;

/// Schedule of one source: its minimum spacing and the start time of the
/// last permitted request.
#[derive(Debug)]
struct RateLimitState {
    min_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimitState {
    fn new(min_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            min_delay,
            last_request: Mutex::new(None),
        })
    }
}

/// Registry of per-source schedules.
#[derive(Debug)]
pub struct RateLimiter {
    sources: RwLock<HashMap<String, Arc<RateLimitState>>>,
    default_delay: Duration,
}

impl RateLimiter {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            default_delay,
        }
    }

    pub fn with_sources<I, S>(default_delay: Duration, sources: I) -> Self
    where
        I: IntoIterator<Item = (S, Duration)>,
        S: Into<String>,
    {
        let limiter = Self::new(default_delay);
        for (source, delay) in sources {
            limiter.set_delay(source, delay);
        }
        limiter
    }

    /// Replace a source's schedule. Meant for startup; a caller already
    /// waiting keeps the schedule it started on.
    pub fn set_delay(&self, source: impl Into<String>, min_delay: Duration) {
        self.sources
            .write()
            .insert(source.into(), RateLimitState::new(min_delay));
    }

    pub fn delay(&self, source: &str) -> Duration {
        self.sources
            .read()
            .get(source)
            .map(|s| s.min_delay)
            .unwrap_or(self.default_delay)
    }

    fn state(&self, source: &str) -> Arc<RateLimitState> {
        if let Some(state) = self.sources.read().get(source) {
            return state.clone();
        }
        self.sources
            .write()
            .entry(source.to_string())
            .or_insert_with(|| RateLimitState::new(self.default_delay))
            .clone()
    }

    /// Wait until `source` may issue its next request. Callers for the same
    /// source queue in order; each one holds the schedule while it sleeps.
    pub async fn acquire(&self, source: &str) {
        let state = self.state(source);
        let mut last_request = state.last_request.lock().await;
        let requested = Instant::now();

        if let Some(last) = *last_request {
            let ready_at = last + state.min_delay;
            if ready_at > requested {
                debug!(source, wait_ms = (ready_at - requested).as_millis() as u64, "Throttling request");
                sleep_until(ready_at).await;
            }
        }

        let now = Instant::now();
        RATE_LIMIT_WAIT
            .with_label_values(&[source])
            .observe((now - requested).as_secs_f64());
        *last_request = Some(now);
    }
}
