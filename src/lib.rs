//! An embedded client for Flagr-compatible feature flag services.
//!
//! Most flags are evaluated entirely in-process against a locally cached
//! copy of the flag definitions — no network round trip on the hot path.
//! A flag is only sent upstream for evaluation when its outcome depends on
//! consistent percentage-based bucketing that this crate cannot reproduce
//! without the upstream's own hashing, which the design intentionally
//! leaves to the service rather than guessing at it here.
//!
//! ## Core features
//!
//! - **Local-first evaluation** — flags gated purely by targeting
//!   constraints (country, plan, user attributes) never leave the process.
//! - **Automatic remote fallback** — partial rollouts and multi-variant
//!   splits are delegated to the upstream, protected by a circuit breaker.
//! - **Disk snapshot** — the last known-good flag set survives process
//!   restarts and upstream outages.
//! - **Webhook-driven invalidation** — `flag.updated`/`flag.deleted`
//!   events refresh just the affected keys (behind the `http-surfaces`
//!   feature).
//!
//! ## Example
//! ```no_run
//! use flagr_client::{Client, FlagrOptions, EvaluationContext, ContextValue};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(FlagrOptions::default()).await.unwrap();
//!
//!     let ctx = EvaluationContext::new("user-123")
//!         .with_property("country", ContextValue::String("BR".into()));
//!     let enabled = client.evaluate_bool("brazil_launch", &ctx).await.unwrap();
//!     println!("brazil_launch: {enabled}");
//!
//!     client.stop().await;
//! }
//! ```

mod cache;
mod circuit;
mod client;
mod config;
mod error;
mod evaluator;
mod model;
mod refresh;
mod snapshot;
mod strategy;
mod upstream;

#[cfg(feature = "http-surfaces")]
pub mod admin;
#[cfg(feature = "http-surfaces")]
pub mod webhook;

pub use cache::CacheMetrics;
pub use circuit::{CircuitStats, State as CircuitState};
pub use client::{Client, ClientStats};
pub use config::{CacheSettings, FallbackStrategy, FlagrOptions};
pub use error::{FlagrError, Result};
pub use model::{
    Constraint, ContextValue, Distribution, EvaluationContext, EvaluationResult, Flag, Operator, Segment, Variant,
    VariantId,
};
pub use refresh::{InvalidationEvent, RefreshStats};
pub use strategy::Strategy;
pub use tokio_util::sync::CancellationToken;
