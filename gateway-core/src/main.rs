//! Binary entry point. `gateway-core` the library never implements the
//! `ConsumerAuthenticator`/`UpstreamPicker` collaborators (spec.md 1) -- the
//! two static, config-file-driven implementations below exist only so this
//! binary can boot standalone; a real deployment swaps them out.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;

use gateway_core::{
    AuthRejection, CliArgs, Consumer, ConsumerAuthenticator, GatewayApp, GatewayConfig, NoUpstreamAvailable,
    UpstreamPicker, UpstreamScheme, UpstreamTarget,
};

struct StaticConsumerAuthenticator {
    config: GatewayConfig,
}

#[async_trait]
impl ConsumerAuthenticator for StaticConsumerAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap, _client_ip: IpAddr) -> Result<Consumer, AuthRejection> {
        let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) else {
            return Err(AuthRejection {
                status: axum::http::StatusCode::UNAUTHORIZED,
                message: "missing x-api-key header".to_string(),
            });
        };

        self.config
            .consumers
            .iter()
            .find(|entry| entry.api_key == api_key)
            .map(|entry| Consumer::new(&entry.name, entry.seconds_quota, entry.monthly_quota, entry.paid_threshold))
            .ok_or_else(|| AuthRejection {
                status: axum::http::StatusCode::UNAUTHORIZED,
                message: "unknown api key".to_string(),
            })
    }
}

struct StaticUpstreamPicker {
    config: GatewayConfig,
}

#[async_trait]
impl UpstreamPicker for StaticUpstreamPicker {
    async fn pick(&self, route_id: &str, network: &str) -> Result<UpstreamTarget, NoUpstreamAvailable> {
        let entry = self
            .config
            .upstreams
            .iter()
            .find(|entry| entry.route_id == route_id && entry.network == network)
            .ok_or_else(|| NoUpstreamAvailable {
                network: network.to_string(),
            })?;

        let scheme = match entry.scheme.as_str() {
            "https" => UpstreamScheme::Https,
            "wss" => UpstreamScheme::Wss,
            "ws" => UpstreamScheme::Ws,
            _ => UpstreamScheme::Http,
        };

        Ok(UpstreamTarget {
            scheme,
            host: entry.host.clone(),
            port: entry.port,
            read_timeout: Duration::from_secs(self.config.upstream_timeout_secs),
        })
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: CliArgs = argh::from_env();
    init_tracing(&args.log_level);

    let config = GatewayConfig::load(&args.config).await?;
    let authenticator = Arc::new(StaticConsumerAuthenticator { config: config.clone() });
    let upstream_picker = Arc::new(StaticUpstreamPicker { config: config.clone() });

    let bind = args.bind.clone();
    let app = GatewayApp::spawn(config, authenticator, upstream_picker).await?;

    let router = Router::new()
        .route("/rpc/:route_id", post(gateway_core::frontend::http_proxy::proxy_rpc))
        .route("/ws/:route_id", get(gateway_core::frontend::websocket_proxy::proxy_ws))
        .route("/metrics", get(metrics_handler))
        .fallback(gateway_core::frontend::errors::handler_404)
        .layer(DefaultBodyLimit::max(gateway_core::jsonrpc::MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer::new([
            axum::http::header::AUTHORIZATION,
        ]))
        .with_state(app);

    tracing::info!(%bind, "gateway-core listening");
    let addr: std::net::SocketAddr = bind.parse()?;
    axum::Server::bind(&addr)
        .serve(router.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .await?;
    Ok(())
}

async fn metrics_handler(axum::extract::State(app): axum::extract::State<Arc<GatewayApp>>) -> String {
    app.metrics.render()
}
