//! Warehouse query jobs with result caching, plus cursor-resumed
//! transaction sync.

pub mod cache;
mod client;
pub mod config;
pub mod diagnostics;
pub mod id;
pub mod job;
pub mod partition;
pub mod sync;
pub mod telemetry;
pub mod warehouse;

pub use client::{Bqt, BqtBuilder, CacheMode, QueryOptions, QuerySubmission};
