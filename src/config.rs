//! Configuration for the client, modeled after the teacher crate's
//! `FlagdOptions`: constructor fields win, environment variables are the
//! fallback, hardcoded defaults are last.

use std::time::Duration;

use crate::error::{FlagrError, Result};

/// Fallback applied whenever the facade would otherwise surface an error to
/// a typed accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Return false / default / zero variant.
    FailClosed,
    /// Return true / default non-empty.
    FailOpen,
    /// Use the cached snapshot if present, even if stale; else fail closed.
    LastKnownGood,
    /// Propagate the error to the caller (only observed by `evaluate`).
    Error,
}

impl From<&str> for FallbackStrategy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "fail_open" => FallbackStrategy::FailOpen,
            "last_known_good" => FallbackStrategy::LastKnownGood,
            "error" => FallbackStrategy::Error,
            _ => FallbackStrategy::FailClosed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Maximum number of flag entries held in the memory store.
    pub max_size: usize,
    /// TTL applied to each cache entry; `None` disables TTL-based expiry.
    pub ttl: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlagrOptions {
    /// Base URL of the upstream Flagr-compatible service, e.g. `http://localhost:18000`.
    pub endpoint: String,
    /// Optional bearer token sent with every upstream request.
    pub api_key: Option<String>,
    /// Interval between background full refreshes.
    pub refresh_interval: Duration,
    /// Timeout bound for the synchronous refresh performed during `Client::new`.
    pub initial_timeout: Duration,
    /// Per-request timeout for upstream HTTP calls.
    pub http_timeout: Duration,
    /// Maximum retry attempts for a single upstream call (5xx/429 only).
    pub retry_attempts: u32,
    /// Memory store sizing/TTL.
    pub cache_settings: CacheSettings,
    /// Whether to persist a last-known-good snapshot to disk.
    pub persistence_enabled: bool,
    /// Directory the disk snapshot file lives under.
    pub persistence_path: Option<String>,
    /// Shared secret used to verify `X-Webhook-Signature` (http-surfaces feature).
    pub webhook_secret: Option<String>,
    /// Whether `admin::full_router` mounts the reference webhook receiver
    /// (http-surfaces feature). The crate never binds a port itself — this
    /// only gates whether the route is present in the returned `Router`.
    pub webhook_enabled: bool,
    /// Path the webhook receiver listens on (http-surfaces feature).
    pub webhook_path: String,
    /// Whether `admin::full_router` mounts the admin control routes
    /// (http-surfaces feature); `/health` is always mounted regardless.
    pub admin_enabled: bool,
    /// Path prefix for admin control routes: `{admin_path}/stats`,
    /// `{admin_path}/refresh`, `{admin_path}/invalidate`,
    /// `{admin_path}/invalidate-all` (http-surfaces feature).
    pub admin_path: String,
    /// Fallback behavior applied on error in typed accessors.
    pub fallback_strategy: FallbackStrategy,
    /// Consecutive failures before the circuit breaker opens.
    pub circuit_max_failures: u32,
    /// How long the circuit stays open before admitting a trial call.
    pub circuit_timeout: Duration,
}

impl Default for FlagrOptions {
    fn default() -> Self {
        let fallback_strategy = std::env::var("FLAGR_FALLBACK_STRATEGY")
            .map(|s| FallbackStrategy::from(s.as_str()))
            .unwrap_or(FallbackStrategy::FailClosed);

        Self {
            endpoint: std::env::var("FLAGR_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:18000".to_string()),
            api_key: std::env::var("FLAGR_API_KEY").ok(),
            refresh_interval: Duration::from_secs(
                std::env::var("FLAGR_REFRESH_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            initial_timeout: Duration::from_millis(
                std::env::var("FLAGR_INITIAL_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            ),
            http_timeout: Duration::from_millis(
                std::env::var("FLAGR_HTTP_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2000),
            ),
            retry_attempts: std::env::var("FLAGR_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            cache_settings: CacheSettings::default(),
            persistence_enabled: std::env::var("FLAGR_PERSISTENCE_ENABLED")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            persistence_path: std::env::var("FLAGR_PERSISTENCE_PATH").ok(),
            webhook_secret: std::env::var("FLAGR_WEBHOOK_SECRET").ok(),
            webhook_enabled: std::env::var("FLAGR_WEBHOOK_ENABLED")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(true),
            webhook_path: std::env::var("FLAGR_WEBHOOK_PATH")
                .unwrap_or_else(|_| "/webhooks/flagr".to_string()),
            admin_enabled: std::env::var("FLAGR_ADMIN_ENABLED")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(true),
            admin_path: std::env::var("FLAGR_ADMIN_PATH").unwrap_or_else(|_| "/admin".to_string()),
            fallback_strategy,
            circuit_max_failures: std::env::var("FLAGR_CIRCUIT_MAX_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            circuit_timeout: Duration::from_secs(
                std::env::var("FLAGR_CIRCUIT_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

impl FlagrOptions {
    /// Rejects configurations that would make the client non-functional.
    /// Invoked from `Client::new` before anything else runs.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(FlagrError::Config("endpoint must not be empty".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(FlagrError::Config(
                "refresh_interval must be greater than zero".into(),
            ));
        }
        if self.initial_timeout.is_zero() {
            return Err(FlagrError::Config(
                "initial_timeout must be greater than zero".into(),
            ));
        }
        if self.http_timeout.is_zero() {
            return Err(FlagrError::Config(
                "http_timeout must be greater than zero".into(),
            ));
        }
        if self.cache_settings.max_size == 0 {
            return Err(FlagrError::Config(
                "cache_settings.max_size must be greater than zero".into(),
            ));
        }
        if self.circuit_max_failures == 0 {
            return Err(FlagrError::Config(
                "circuit_max_failures must be greater than zero".into(),
            ));
        }
        if self.circuit_timeout.is_zero() {
            return Err(FlagrError::Config(
                "circuit_timeout must be greater than zero".into(),
            ));
        }
        if self.persistence_enabled && self.persistence_path.is_none() {
            return Err(FlagrError::Config(
                "persistence_enabled requires persistence_path".into(),
            ));
        }
        if self.webhook_enabled && self.webhook_path.trim().is_empty() {
            return Err(FlagrError::Config(
                "webhook_enabled requires a non-empty webhook_path".into(),
            ));
        }
        if self.admin_enabled && self.admin_path.trim().is_empty() {
            return Err(FlagrError::Config(
                "admin_enabled requires a non-empty admin_path".into(),
            ));
        }
        Ok(())
    }
}
