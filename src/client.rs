//! Client facade (C9): the crate's public entry point. Wires the upstream
//! adapter, memory store, circuit breaker, disk snapshot and refresh
//! coordinator together and dispatches each evaluation to the local or
//! remote path per the strategy determiner (C6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheMetrics, MemoryStore};
use crate::circuit::{CircuitBreaker, CircuitStats};
use crate::config::{FallbackStrategy, FlagrOptions};
use crate::error::{FlagrError, Result};
use crate::evaluator::ConstraintEvaluator;
use crate::model::{EvaluationContext, EvaluationResult, Flag};
use crate::refresh::{InvalidationEvent, RefreshCoordinator, RefreshStats};
use crate::snapshot::DiskSnapshot;
use crate::strategy::{self, Strategy};
use crate::upstream::{HttpUpstream, Upstream};

/// Point-in-time health/usage snapshot, exposed for an admin surface (C10)
/// or plain operator polling.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientStats {
    pub cache: CacheMetrics,
    pub circuit: CircuitStats,
    pub refresh: RefreshStats,
    pub cached_flags: usize,
}

pub struct Client {
    store: Arc<MemoryStore>,
    circuit: Arc<CircuitBreaker>,
    upstream: Arc<dyn Upstream>,
    refresh: Arc<RefreshCoordinator>,
    fallback_strategy: FallbackStrategy,
    shutdown_tx: watch::Sender<bool>,
    periodic_handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Client {
    /// Validates `options`, performs the initial disk-snapshot load and a
    /// bounded synchronous refresh, then starts the periodic background
    /// refresh. Returns as soon as the client has *some* usable state —
    /// from disk, from upstream, or empty if both are unavailable.
    #[instrument(skip(options))]
    pub async fn new(options: FlagrOptions) -> Result<Self> {
        options.validate()?;

        let store = Arc::new(MemoryStore::new(
            options.cache_settings.max_size,
            options.cache_settings.ttl,
        ));
        let circuit = Arc::new(CircuitBreaker::new(options.circuit_max_failures, options.circuit_timeout));
        let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(&options)?);
        let snapshot = options
            .persistence_enabled
            .then(|| options.persistence_path.as_ref().map(|p| Arc::new(DiskSnapshot::new(p))))
            .flatten();

        let refresh = Arc::new(RefreshCoordinator::new(
            upstream.clone(),
            store.clone(),
            circuit.clone(),
            snapshot,
        ));
        refresh.initial_load(options.initial_timeout).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let periodic_handle = {
            let refresh = refresh.clone();
            let interval = options.refresh_interval;
            tokio::spawn(refresh.run_periodic(interval, shutdown_rx))
        };

        Ok(Self {
            store,
            circuit,
            upstream,
            refresh,
            fallback_strategy: options.fallback_strategy,
            shutdown_tx,
            periodic_handle: Mutex::new(Some(periodic_handle)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Evaluates `flag_key` against `ctx`, dispatching locally or remotely
    /// per the strategy determiner. Errors are returned as-is; applying a
    /// fallback policy is the caller's job via [`Client::evaluate_bool`] /
    /// [`Client::evaluate_string`], or its own judgment when calling this
    /// directly.
    #[instrument(skip(self, ctx))]
    pub async fn evaluate(&self, flag_key: &str, ctx: &EvaluationContext) -> Result<EvaluationResult> {
        self.evaluate_cancellable(flag_key, ctx, &CancellationToken::new()).await
    }

    /// As [`Client::evaluate`], but honors `token`: if it's cancelled while
    /// the call is in the remote path, returns [`FlagrError::Cancelled`]
    /// without mutating circuit-breaker or cache state. The local path never
    /// suspends, so cancellation has no effect on it — it would already have
    /// returned by the time a cancellation could be observed.
    #[instrument(skip(self, ctx, token))]
    pub async fn evaluate_cancellable(
        &self,
        flag_key: &str,
        ctx: &EvaluationContext,
        token: &CancellationToken,
    ) -> Result<EvaluationResult> {
        let Some(flag) = self.store.get(flag_key).await else {
            return Err(FlagrError::NotFound(flag_key.to_string()));
        };

        let (decision, reason) = strategy::determine(&flag);
        debug!(flag_key, ?decision, reason, "strategy decision");

        match decision {
            Strategy::Local => Ok(ConstraintEvaluator::evaluate(&flag, ctx)),
            Strategy::Remote => {
                let upstream = self.upstream.clone();
                let key = flag_key.to_string();
                let ctx_owned = ctx.clone();
                let call = self
                    .circuit
                    .call(|| async move { upstream.evaluate(&key, &ctx_owned).await });
                tokio::select! {
                    result = call => result,
                    _ = token.cancelled() => {
                        debug!(flag_key, "evaluation cancelled while awaiting remote call");
                        Err(FlagrError::Cancelled)
                    }
                }
            }
        }
    }

    /// Typed boolean accessor. Never propagates an error: any evaluation
    /// failure applies the configured [`FallbackStrategy`], including
    /// `Error` (typed accessors apply a real fallback even then — only
    /// `evaluate` itself surfaces errors to the caller). Per §4.7 there is
    /// no caller-supplied default here: an unmatched variant key, a missing
    /// flag, and every fallback outcome except `fail_open` all resolve to
    /// `false`.
    #[instrument(skip(self, ctx))]
    pub async fn evaluate_bool(&self, flag_key: &str, ctx: &EvaluationContext) -> Result<bool> {
        match self.evaluate(flag_key, ctx).await {
            Ok(result) => Ok(Self::variant_key_to_bool(result.variant_key.as_deref())),
            Err(err) => self.apply_bool_fallback(flag_key, ctx, err).await,
        }
    }

    /// Typed string accessor, returning the winning variant's key.
    #[instrument(skip(self, ctx))]
    pub async fn evaluate_string(&self, flag_key: &str, ctx: &EvaluationContext, default: &str) -> Result<String> {
        match self.evaluate(flag_key, ctx).await {
            Ok(result) => Ok(result.variant_key.unwrap_or_else(|| default.to_string())),
            Err(err) => self.apply_string_fallback(flag_key, ctx, default, err).await,
        }
    }

    /// Treats `enabled`/`on`/`true` as true; every other variant key,
    /// including an absent one, is false. Per §4.7 there is no "unmatched"
    /// case that falls through to a caller-supplied default.
    fn variant_key_to_bool(variant_key: Option<&str>) -> bool {
        matches!(
            variant_key.map(|key| key.to_lowercase()).as_deref(),
            Some("on" | "true" | "enabled")
        )
    }

    async fn apply_bool_fallback(&self, flag_key: &str, ctx: &EvaluationContext, err: FlagrError) -> Result<bool> {
        match self.fallback_strategy {
            // Typed accessors never propagate: `Error` still means
            // fail-closed here, it only changes `evaluate`'s own behavior.
            FallbackStrategy::Error | FallbackStrategy::FailClosed => {
                warn!(flag_key, error = %err, "evaluation failed, failing closed");
                Ok(false)
            }
            FallbackStrategy::FailOpen => {
                warn!(flag_key, error = %err, "evaluation failed, failing open");
                Ok(true)
            }
            FallbackStrategy::LastKnownGood => match self.last_known_good(flag_key, ctx).await {
                Some(result) => Ok(Self::variant_key_to_bool(result.variant_key.as_deref())),
                None => {
                    warn!(flag_key, error = %err, "no last-known-good snapshot, failing closed");
                    Ok(false)
                }
            },
        }
    }

    async fn apply_string_fallback(
        &self,
        flag_key: &str,
        ctx: &EvaluationContext,
        default: &str,
        err: FlagrError,
    ) -> Result<String> {
        match self.fallback_strategy {
            // Typed accessors never propagate: `Error` still means
            // fail-closed here, it only changes `evaluate`'s own behavior.
            FallbackStrategy::Error | FallbackStrategy::FailClosed => {
                warn!(flag_key, error = %err, "evaluation failed, failing closed");
                Ok(default.to_string())
            }
            FallbackStrategy::FailOpen => {
                warn!(flag_key, error = %err, "evaluation failed, failing open");
                Ok(default.to_string())
            }
            FallbackStrategy::LastKnownGood => match self.last_known_good(flag_key, ctx).await {
                Some(result) => Ok(result.variant_key.unwrap_or_else(|| default.to_string())),
                None => {
                    warn!(flag_key, error = %err, "no last-known-good snapshot, failing closed");
                    Ok(default.to_string())
                }
            },
        }
    }

    /// Evaluates against whatever is in the local cache regardless of
    /// strategy, used only as the `LastKnownGood` fallback path when a
    /// remote call has just failed.
    async fn last_known_good(&self, flag_key: &str, ctx: &EvaluationContext) -> Option<EvaluationResult> {
        let flag = self.store.get(flag_key).await?;
        Some(ConstraintEvaluator::evaluate(&flag, ctx))
    }

    /// Forces an immediate full refresh, collapsing with any already
    /// in-flight refresh.
    pub async fn refresh_flags(&self) -> Result<()> {
        self.refresh.refresh_all().await
    }

    /// Targeted invalidation for a single flag key, as driven by a webhook
    /// `flag.updated`/`flag.deleted` event or an admin call.
    pub async fn invalidate_flag(&self, flag_key: &str) -> Result<()> {
        self.refresh.invalidate_flag(flag_key).await
    }

    pub async fn invalidate_all(&self) -> Result<()> {
        self.refresh.invalidate_all().await
    }

    pub async fn apply_invalidation_event(&self, event: InvalidationEvent) -> Result<()> {
        self.refresh.apply_event(event).await
    }

    pub async fn get_stats(&self) -> ClientStats {
        ClientStats {
            cache: self.store.metrics().await,
            circuit: self.circuit.stats().await,
            refresh: self.refresh.stats().await,
            cached_flags: self.store.len().await,
        }
    }

    pub async fn snapshot_flags(&self) -> HashMap<String, Flag> {
        self.refresh.snapshot_flags().await
    }

    /// Stops the periodic refresh task and performs a best-effort final disk
    /// save before returning. Idempotent: calling this more than once, or
    /// after the client was never fully started, is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.periodic_handle.lock().await.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "periodic refresh task did not shut down cleanly");
            }
        }
        self.refresh.save_on_shutdown().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContextValue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_against(server: &MockServer) -> Client {
        let mut options = FlagrOptions::default();
        options.endpoint = server.uri();
        options.refresh_interval = std::time::Duration::from_secs(3600);
        options.initial_timeout = std::time::Duration::from_millis(500);
        Client::new(options).await.unwrap()
    }

    #[tokio::test]
    async fn evaluate_missing_flag_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let ctx = EvaluationContext::new("user-1");
        let result = client.evaluate("missing", &ctx).await;
        assert!(matches!(result, Err(FlagrError::NotFound(_))));
        client.stop().await;
    }

    #[tokio::test]
    async fn evaluate_local_flag_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flags/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 1,
                "key": "brazil_launch",
                "enabled": true,
                "variants": [{"id": 1, "key": "on", "attachment": {}}],
                "segments": [{
                    "id": 1, "rank": 0, "rollout_percent": 100,
                    "constraints": [{"property": "country", "operator": "EQ", "value": "BR"}],
                    "distributions": [{"percent": 100, "variant_id": 1}]
                }],
                "updated_at": 0
            })))
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let ctx = EvaluationContext::new("user-1").with_property("country", ContextValue::String("BR".into()));
        let result = client.evaluate("brazil_launch", &ctx).await.unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("on"));
        assert!(result.evaluated_locally);
        client.stop().await;
    }

    #[tokio::test]
    async fn evaluate_bool_fails_closed_on_error_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let ctx = EvaluationContext::new("user-1");
        let result = client.evaluate_bool("missing", &ctx).await.unwrap();
        assert_eq!(result, false);
        client.stop().await;
    }

    #[tokio::test]
    async fn evaluate_bool_on_error_strategy_fails_closed_not_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
            .mount(&server)
            .await;

        let mut options = FlagrOptions::default();
        options.endpoint = server.uri();
        options.refresh_interval = std::time::Duration::from_secs(3600);
        options.initial_timeout = std::time::Duration::from_millis(500);
        options.fallback_strategy = FallbackStrategy::Error;
        let client = Client::new(options).await.unwrap();

        let ctx = EvaluationContext::new("user-1");
        let result = client.evaluate_bool("missing", &ctx).await;
        assert_eq!(result.unwrap(), false);
        client.stop().await;
    }

    #[tokio::test]
    async fn evaluate_bool_unmatched_variant_key_is_false_not_caller_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 3}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flags/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 3,
                "key": "ui_theme",
                "enabled": true,
                "variants": [{"id": 1, "key": "dark", "attachment": {}}],
                "segments": [{
                    "id": 1, "rank": 0, "rollout_percent": 100,
                    "constraints": [],
                    "distributions": [{"percent": 100, "variant_id": 1}]
                }],
                "updated_at": 0
            })))
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let ctx = EvaluationContext::new("user-1");
        let result = client.evaluate_bool("ui_theme", &ctx).await.unwrap();
        assert_eq!(result, false);
        client.stop().await;
    }

    #[tokio::test]
    async fn cancelled_token_aborts_remote_evaluation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 2}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flags/2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 2,
                "key": "gradual_30",
                "enabled": true,
                "variants": [{"id": 1, "key": "enabled", "attachment": {}}],
                "segments": [{
                    "id": 1, "rank": 0, "rollout_percent": 30,
                    "constraints": [],
                    "distributions": [{"percent": 100, "variant_id": 1}]
                }],
                "updated_at": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/evaluation"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"flagID": 2, "flagKey": "gradual_30"}))
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = client_against(&server).await;
        let ctx = EvaluationContext::new("user-1");
        let token = crate::CancellationToken::new();
        token.cancel();

        let result = client.evaluate_cancellable("gradual_30", &ctx, &token).await;
        assert!(matches!(result, Err(FlagrError::Cancelled)));
        client.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<serde_json::Value>::new()))
            .mount(&server)
            .await;
        let client = client_against(&server).await;
        client.stop().await;
        client.stop().await;
    }
}
