//! `GatewayApp`: wires the config store, Redis rate limiter, guard, and
//! metrics into the ordered pipeline described in spec.md 4.8, and exposes
//! it to the frontend as `handle_http_rpc`/the WebSocket equivalents.

use std::borrow::Cow;
use std::net::IpAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use tracing::{instrument, warn};

use deferred_rate_limiter::{calculate as calculate_cu, check as check_whitelist, DeferredConfigStore};
use redis_rate_limiter::{CircuitOutcome, RedisRateLimiter};

use crate::config::{GatewayConfig, RouteConfig};
use crate::consumer::{Consumer, ConsumerAuthenticator};
use crate::context::RequestContext;
use crate::errors::{whitelist_denial_code, GatewayError};
use crate::guard::Guard;
use crate::jsonrpc::{self, JsonRpcId};
use crate::metrics::Metrics;
use crate::pipeline::{apply_monthly_quota_headers, apply_rate_limit_headers, PipelineOutcome};
use crate::upstream::UpstreamPicker;

pub struct GatewayApp {
    pub config: GatewayConfig,
    pub config_store: DeferredConfigStore,
    pub redis: RedisRateLimiter,
    pub guard: Guard,
    pub metrics: Metrics,
    pub authenticator: Arc<dyn ConsumerAuthenticator>,
    pub upstream_picker: Arc<dyn UpstreamPicker>,
    pub http_client: reqwest::Client,
}

impl GatewayApp {
    pub async fn spawn(
        config: GatewayConfig,
        authenticator: Arc<dyn ConsumerAuthenticator>,
        upstream_picker: Arc<dyn UpstreamPicker>,
    ) -> anyhow::Result<Arc<Self>> {
        let redis = RedisRateLimiter::new(&config.redis.url, config.redis.pool_size).await?;
        let guard = Guard::new(config.guard.clone());

        Ok(Arc::new(Self {
            config,
            config_store: DeferredConfigStore::new(),
            redis,
            guard,
            metrics: Metrics::new(),
            authenticator,
            upstream_picker,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
        }))
    }

    pub fn route(&self, route_id: &str) -> Option<&RouteConfig> {
        self.config.route(route_id)
    }

    /// The full HTTP POST pipeline, spec.md 4.8, steps 1-10.
    #[instrument(skip(self, body), fields(route_id = %route.id))]
    pub async fn handle_http_rpc(
        self: &Arc<Self>,
        route: &RouteConfig,
        consumer: Consumer,
        client_ip: IpAddr,
        host: &str,
        body: Bytes,
    ) -> Response {
        let mut ctx = RequestContext::new(consumer);

        if let PipelineOutcome::Terminate(response) = self.stage_guard_pre_parse(client_ip, &mut ctx) {
            self.finish("guard_blocked", &ctx, response)
        } else if let PipelineOutcome::Terminate(response) = self.stage_parse(&body, &mut ctx) {
            self.finish("parse_error", &ctx, response)
        } else if let PipelineOutcome::Terminate(response) = self.stage_guard_post_parse(&mut ctx) {
            self.finish("guard_blocked", &ctx, response)
        } else if let PipelineOutcome::Terminate(response) = self.stage_extract_network(route, host, &mut ctx) {
            self.finish("bad_network", &ctx, response)
        } else if let PipelineOutcome::Terminate(response) = self.stage_whitelist(route, &mut ctx).await {
            self.finish("whitelist_rejected", &ctx, response)
        } else {
            self.stage_cu(route, &mut ctx).await;

            if let PipelineOutcome::Terminate(response) = self.stage_monthly_quota(&mut ctx).await {
                self.finish("quota_exceeded", &ctx, response)
            } else if let PipelineOutcome::Terminate(response) = self.stage_rate_limit(&mut ctx).await {
                self.finish("rate_limited", &ctx, response)
            } else {
                let network = ctx.network.clone().expect("network extracted before forward");
                let response = self.stage_forward(route, &network, body, &ctx).await;
                self.finish("ok", &ctx, response)
            }
        }
    }

    /// Records terminal metrics and stamps rate-limit/quota headers, win or
    /// lose, then returns the response unchanged otherwise.
    fn finish(&self, status: &'static str, ctx: &RequestContext, mut response: Response) -> Response {
        let network = ctx.network.as_deref().unwrap_or("unknown");
        let method = ctx
            .parsed
            .as_ref()
            .and_then(|p| p.methods.first())
            .map(String::as_str)
            .unwrap_or("unknown");

        self.metrics.record_request(network, method, &ctx.consumer.name, status);
        self.metrics.record_cu_consumed(network, method, &ctx.consumer.name, ctx.cu);
        self.metrics.observe_request_duration(network, method, ctx.elapsed_seconds());

        if let Some((limit, remaining, window_ms)) = ctx.rate_limit_headers {
            apply_rate_limit_headers(&mut response, limit, remaining, window_ms);
        }
        if let Some((quota, used, remaining)) = ctx.quota_headers {
            apply_monthly_quota_headers(&mut response, quota, used, remaining);
        }
        response
    }

    fn stage_guard_pre_parse(&self, client_ip: IpAddr, ctx: &mut RequestContext) -> PipelineOutcome {
        if self.guard.check_pre_parse(client_ip, &ctx.consumer.name) {
            self.metrics.record_guard_block("pre_parse");
            let err = GatewayError::GuardBlocked {
                message: Cow::Owned(self.guard.block_message().to_string()),
                id: JsonRpcId::null(),
            };
            return PipelineOutcome::Terminate(err.into_response());
        }
        PipelineOutcome::Continue
    }

    fn stage_parse(&self, body: &[u8], ctx: &mut RequestContext) -> PipelineOutcome {
        match jsonrpc::parse(body, true) {
            Ok(parsed) => {
                ctx.record("batch", parsed.is_batch.to_string());
                ctx.parsed = Some(parsed);
                PipelineOutcome::Continue
            }
            Err(kind) => {
                let err = GatewayError::JsonRpcParse {
                    code: kind.code(),
                    message: Cow::Owned(kind.message()),
                    id: JsonRpcId::null(),
                };
                PipelineOutcome::Terminate(err.into_response())
            }
        }
    }

    /// Method-level guard predicates need the parsed body, so this runs a
    /// second time after `stage_parse` (spec.md 4.8, Ordering is fixed).
    fn stage_guard_post_parse(&self, ctx: &mut RequestContext) -> PipelineOutcome {
        let parsed = ctx.parsed.as_ref().expect("parse stage runs before guard's method check");
        if self.guard.check_post_parse(&parsed.methods) {
            self.metrics.record_guard_block("post_parse");
            let err = GatewayError::GuardBlocked {
                message: Cow::Owned(self.guard.block_message().to_string()),
                id: ctx.first_id(),
            };
            return PipelineOutcome::Terminate(err.into_response());
        }
        PipelineOutcome::Continue
    }

    fn stage_extract_network(&self, route: &RouteConfig, host: &str, ctx: &mut RequestContext) -> PipelineOutcome {
        let network = route
            .network_override
            .clone()
            .or_else(|| jsonrpc::extract_network(host));

        match network {
            Some(network) => {
                ctx.network = Some(network);
                PipelineOutcome::Continue
            }
            None => {
                let err = GatewayError::WhitelistRejected {
                    code: -32600,
                    message: Cow::Borrowed("unsupported network"),
                    id: ctx.first_id(),
                };
                PipelineOutcome::Terminate(err.into_response())
            }
        }
    }

    async fn stage_whitelist(&self, route: &RouteConfig, ctx: &mut RequestContext) -> PipelineOutcome {
        let network = ctx.network.clone().expect("network extracted before whitelist");

        let snapshot = match self
            .config_store
            .load_whitelist(&route.id, &route.whitelist_path, route.config_ttl(), false)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let err = GatewayError::ConfigUnavailable(Cow::Owned(format!("whitelist unavailable: {err}")));
                return PipelineOutcome::Terminate(err.into_response());
            }
        };

        let parsed = ctx.parsed.as_ref().expect("parsed before whitelist");
        let live_methods: Vec<String> = parsed.live_methods().map(|(_, m)| m.to_string()).collect();

        match check_whitelist(&network, &live_methods, ctx.consumer.is_paid(), &snapshot) {
            Ok(()) => PipelineOutcome::Continue,
            Err(denial) => {
                self.metrics.record_whitelist_rejection(&network, &denial.reason());
                let err = GatewayError::WhitelistRejected {
                    code: whitelist_denial_code(&denial),
                    message: Cow::Owned(denial.reason()),
                    id: ctx.first_id(),
                };
                PipelineOutcome::Terminate(err.into_response())
            }
        }
    }

    /// CU-config load failure never rejects the request -- spec.md 4.8 step
    /// 6 falls back to `cu = 1` per method and just logs.
    async fn stage_cu(&self, route: &RouteConfig, ctx: &mut RequestContext) {
        let parsed = ctx.parsed.as_ref().expect("parsed before CU accounting");
        let methods = parsed.methods.clone();

        let snapshot = match self
            .config_store
            .load_cu_pricing(&route.id, &route.cu_pricing_path, route.config_ttl(), false)
            .await
        {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(%err, route_id = %route.id, "cu pricing config unavailable, falling back to 1 cu/method");
                None
            }
        };

        let cu = calculate_cu(&methods, snapshot.as_deref());
        ctx.cu = cu;
        ctx.record("cu", cu.to_string());
    }

    /// Fail-closed by default (spec.md 4.7, 7): any Redis trouble rejects
    /// with 503 rather than risk unbounded free usage.
    async fn stage_monthly_quota(&self, ctx: &mut RequestContext) -> PipelineOutcome {
        if !ctx.consumer.monthly_quota_enabled() {
            return PipelineOutcome::Continue;
        }

        let consumer = ctx.consumer.name.clone();
        let monthly_quota = ctx.consumer.monthly_quota;
        let cu = ctx.cu as i64;
        let now = Utc::now();

        let outcome = self
            .redis
            .breaker
            .execute(&self.redis.endpoint, || async {
                let mut conn = self.redis.pool.get().await.map_err(GatewayError::from)?;
                self.redis
                    .monthly_quota
                    .check_and_increment(&mut conn, &consumer, monthly_quota, cu, now)
                    .await
                    .map_err(GatewayError::from)
            })
            .await;

        self.metrics
            .set_circuit_breaker_state(&self.redis.endpoint, self.redis.breaker.state(&self.redis.endpoint));

        match outcome {
            CircuitOutcome::Allowed(Ok(quota)) => {
                self.metrics.record_redis_operation("monthly_quota", "ok");
                self.metrics.set_consumer_monthly(&ctx.consumer.name, monthly_quota, quota.used);
                ctx.quota_headers = Some((monthly_quota, quota.used, quota.remaining));

                if !quota.allowed {
                    self.metrics.record_quota_exceeded(&ctx.consumer.name);
                    let err = GatewayError::QuotaExceeded { id: ctx.first_id() };
                    return PipelineOutcome::Terminate(err.into_response());
                }
                ctx.record("monthly_used", quota.used.to_string());
                PipelineOutcome::Continue
            }
            CircuitOutcome::Allowed(Err(err)) => {
                self.metrics.record_redis_operation("monthly_quota", "error");
                warn!(?err, "monthly quota redis error, failing closed");
                PipelineOutcome::Terminate(GatewayError::QuotaServiceUnavailable.into_response())
            }
            CircuitOutcome::Blocked => {
                self.metrics.record_redis_operation("monthly_quota", "circuit_open");
                PipelineOutcome::Terminate(GatewayError::QuotaServiceUnavailable.into_response())
            }
        }
    }

    /// Fail-open by default, per `redis.allow_degradation` (spec.md 4.6, 7).
    async fn stage_rate_limit(&self, ctx: &mut RequestContext) -> PipelineOutcome {
        if !ctx.consumer.rate_limit_enabled() {
            return PipelineOutcome::Continue;
        }

        let consumer = ctx.consumer.name.clone();
        let limit = ctx.consumer.seconds_quota;
        let cu = ctx.cu as i64;
        let request_id =
            redis_rate_limiter::SlidingWindowRateLimiter::request_id(ctx.connection_nonce.as_deref());
        let window_ms = self.redis.sliding_window.window_ms;

        let outcome = self
            .redis
            .breaker
            .execute(&self.redis.endpoint, || async {
                let mut conn = self.redis.pool.get().await.map_err(GatewayError::from)?;
                self.redis
                    .sliding_window
                    .check_and_increment(&mut conn, &consumer, limit, cu, &request_id)
                    .await
                    .map_err(GatewayError::from)
            })
            .await;

        self.metrics
            .set_circuit_breaker_state(&self.redis.endpoint, self.redis.breaker.state(&self.redis.endpoint));

        match outcome {
            CircuitOutcome::Allowed(Ok(result)) => {
                self.metrics.record_redis_operation("sliding_window", "ok");
                ctx.rate_limit_headers = Some((limit, result.remaining, window_ms));

                if !result.allowed {
                    self.metrics.record_rate_limit_exceeded(&ctx.consumer.name, "sliding");
                    let retry_after_secs = (window_ms as f64 / 1000.0).ceil() as u64;
                    let err = GatewayError::RateLimitExceeded {
                        id: ctx.first_id(),
                        retry_after_secs,
                    };
                    return PipelineOutcome::Terminate(err.into_response());
                }
                ctx.record("cu_in_window", result.cu_in_window.to_string());
                PipelineOutcome::Continue
            }
            CircuitOutcome::Allowed(Err(err)) => {
                self.metrics.record_redis_operation("sliding_window", "error");
                self.degrade_rate_limit(err, ctx, limit, window_ms)
            }
            CircuitOutcome::Blocked => {
                self.metrics.record_redis_operation("sliding_window", "circuit_open");
                self.degrade_rate_limit(GatewayError::RateLimitServiceUnavailable, ctx, limit, window_ms)
            }
        }
    }

    fn degrade_rate_limit(
        &self,
        err: GatewayError,
        ctx: &mut RequestContext,
        limit: i64,
        window_ms: i64,
    ) -> PipelineOutcome {
        if self.config.redis.allow_degradation {
            warn!(consumer = %ctx.consumer.name, %err, "rate limiter degraded, failing open");
            ctx.rate_limit_headers = Some((limit, limit, window_ms));
            PipelineOutcome::Continue
        } else {
            warn!(consumer = %ctx.consumer.name, %err, "rate limiter unavailable, failing closed");
            PipelineOutcome::Terminate(GatewayError::RateLimitServiceUnavailable.into_response())
        }
    }

    /// The WebSocket per-message pipeline (spec.md 4.9): C1 -> C3 -> C4 ->
    /// C7 -> C6, reusing the HTTP stages. Guard and network extraction
    /// already ran once at handshake time, so they don't run per message.
    /// `Err` carries a ready-to-send JSON-RPC error body; the caller sends
    /// it as a text frame and keeps the connection open.
    pub async fn handle_ws_message(
        self: &Arc<Self>,
        route: &RouteConfig,
        network: &str,
        consumer: &Consumer,
        connection_nonce: &str,
        text: &[u8],
    ) -> Result<(), Vec<u8>> {
        let mut ctx = RequestContext::for_websocket_message(consumer.clone(), connection_nonce.to_string());
        ctx.network = Some(network.to_string());

        if let PipelineOutcome::Terminate(response) = self.stage_parse(text, &mut ctx) {
            return Err(crate::pipeline::response_body_bytes(response).await);
        }
        if let PipelineOutcome::Terminate(response) = self.stage_whitelist(route, &mut ctx).await {
            return Err(crate::pipeline::response_body_bytes(response).await);
        }

        self.stage_cu(route, &mut ctx).await;

        if let PipelineOutcome::Terminate(response) = self.stage_monthly_quota(&mut ctx).await {
            return Err(crate::pipeline::response_body_bytes(response).await);
        }
        if let PipelineOutcome::Terminate(response) = self.stage_rate_limit(&mut ctx).await {
            return Err(crate::pipeline::response_body_bytes(response).await);
        }

        let method = ctx.parsed.as_ref().and_then(|p| p.methods.first()).map(String::as_str).unwrap_or("unknown");
        self.metrics.record_request(network, method, &consumer.name, "ok");
        self.metrics.record_cu_consumed(network, method, &consumer.name, ctx.cu);
        Ok(())
    }

    async fn stage_forward(&self, route: &RouteConfig, network: &str, body: Bytes, _ctx: &RequestContext) -> Response {
        let upstream = match self.upstream_picker.pick(&route.id, network).await {
            Ok(target) => target,
            Err(err) => {
                warn!(%err, route_id = %route.id, network, "no upstream available");
                return GatewayError::Internal(Cow::Owned(err.to_string())).into_response();
            }
        };

        let url = upstream.http_url("");
        let response = self
            .http_client
            .post(&url)
            .header("content-type", "application/json")
            .timeout(upstream.read_timeout)
            .body(body)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
                match resp.bytes().await {
                    Ok(bytes) => (status, bytes).into_response(),
                    Err(err) => {
                        warn!(?err, "failed to read upstream response body");
                        GatewayError::Internal(Cow::Owned(err.to_string())).into_response()
                    }
                }
            }
            Err(err) => {
                warn!(?err, upstream = %url, "upstream forward failed");
                GatewayError::Internal(Cow::Owned(err.to_string())).into_response()
            }
        }
    }
}
