// src/error.rs

//! Error taxonomy for fetching, collecting and configuration.
//!
//! `FetchError` classifies a single outbound request chain, `CollectError`
//! is what a collector hands back to the cycle (it is `Clone` so one shared
//! in-flight fetch can give the same error to every waiter), and
//! `ConfigError` is raised once at startup validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a failed fetch after classification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Timeout, connection failure or HTTP 5xx.
    #[error("transient network error{}: {message}", status_suffix(.status))]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// HTTP 429 or a vendor rate-limit body.
    #[error("rate limited (status {status}){}", retry_suffix(.retry_after))]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Invalid or revoked credential.
    #[error("authentication rejected (status {status}): {message}")]
    Auth { status: u16, message: String },

    /// Malformed request; retrying will not help.
    #[error("request rejected (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    /// The response arrived but its body could not be read.
    #[error("response decode failed: {0}")]
    Decode(String),

    /// Retryable failures exhausted the retry policy.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether the retry loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }

    /// Upstream retry-after hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Taxonomy bucket used in cycle reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::TransientNetwork,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::BadRequest { .. } | Self::Decode(_) => ErrorKind::SourceUnavailable,
            Self::Exhausted { .. } => ErrorKind::SourceUnavailable,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {:.1}s", d.as_secs_f64()))
        .unwrap_or_default()
}

/// Failure of one collector for one cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The whole response was unusable (individual bad items are dropped instead).
    #[error("parse error in {source_id}: {message}")]
    Parse { source_id: String, message: String },

    /// The source cannot be reached at all (missing renderer, closed channel, ...).
    #[error("source {source_id} unavailable: {message}")]
    SourceUnavailable { source_id: String, message: String },

    /// Collector misconfiguration discovered at fetch time (e.g. missing API key).
    #[error("source {source_id} misconfigured: {message}")]
    Config { source_id: String, message: String },
}

impl CollectError {
    pub fn parse(source_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    pub fn unavailable(source_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    pub fn config(source_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Config {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Parse { .. } => ErrorKind::Parse,
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::Config { .. } => ErrorKind::Auth,
        }
    }

    /// Auth failures lock the source out until it is re-enabled.
    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

/// Error buckets surfaced in `CycleResult.errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    Auth,
    Parse,
    SourceUnavailable,
    Timeout,
    CacheCorruption,
}

/// Startup configuration validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: String, message: String },

    #[error("duplicate source id `{0}`")]
    DuplicateSource(String),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}
