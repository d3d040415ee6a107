// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod cache;
pub mod collect;
pub mod combine;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod notify;
pub mod publish;
pub mod scheduler;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::cache::{Cache, TtlClass};
pub use crate::collect::{CollectOutcome, RegisteredSource, TrendCollector};
pub use crate::config::{AppConfig, SourceParams};
pub use crate::error::{CollectError, ConfigError, ErrorKind, FetchError};
pub use crate::fetch::{FetchRequest, FetchResponse, Fetcher, Transport};
pub use crate::publish::{CycleSink, Publisher};
pub use crate::scheduler::{Scheduler, SchedulerHandle, SchedulerState};
pub use crate::types::{CombinedTrend, CycleResult, RawTrendItem, SourceBatch, SourceId};
