//! Library entrypoint: re‑export modules

pub mod cache;
pub mod config;
pub mod connection;
pub mod errors;
pub mod executor;
pub mod ingestor;
pub mod metrics;
pub mod rate_limit;
pub mod stats;
