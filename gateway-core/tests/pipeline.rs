//! End-to-end pipeline tests against a real Redis instance. `GatewayApp`
//! builds its bb8 pool eagerly, so these need a reachable
//! `redis://127.0.0.1:6379` (override with `GATEWAY_TEST_REDIS_URL`).
//! Run with `cargo test --test pipeline -- --ignored` once one is up.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use gateway_core::guard::GuardConfig;
use gateway_core::{
    AuthRejection, Consumer, ConsumerAuthenticator, GatewayApp, GatewayConfig, NoUpstreamAvailable, RedisConfig,
    RouteConfig, UpstreamPicker, UpstreamScheme, UpstreamTarget,
};

struct FixedConsumer(Consumer);

#[async_trait]
impl ConsumerAuthenticator for FixedConsumer {
    async fn authenticate(&self, _headers: &HeaderMap, _client_ip: IpAddr) -> Result<Consumer, AuthRejection> {
        Ok(self.0.clone())
    }
}

struct SingleUpstream(UpstreamTarget);

#[async_trait]
impl UpstreamPicker for SingleUpstream {
    async fn pick(&self, _route_id: &str, _network: &str) -> Result<UpstreamTarget, NoUpstreamAvailable> {
        Ok(self.0.clone())
    }
}

struct UnreachableUpstream;

#[async_trait]
impl UpstreamPicker for UnreachableUpstream {
    async fn pick(&self, _route_id: &str, network: &str) -> Result<UpstreamTarget, NoUpstreamAvailable> {
        panic!("upstream should never be consulted for a request the pipeline rejects earlier: {network}");
    }
}

fn fixture_dir() -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("gateway-core-pipeline-test-{}-{}", std::process::id(), unique_suffix()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn unique_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    format!("{}", SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos())
}

fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn redis_url() -> String {
    std::env::var("GATEWAY_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/1".to_string())
}

fn eth_mainnet_route(dir: &Path) -> RouteConfig {
    let whitelist_path = write_fixture(
        dir,
        "whitelist.json",
        r#"{"networks":{"eth-mainnet":{"free":["eth_blockNumber"],"paid":["debug_*"]}}}"#,
    );
    let cu_pricing_path = write_fixture(dir, "cu_pricing.json", r#"{"default":1,"methods":{"eth_blockNumber":5}}"#);

    RouteConfig {
        id: "eth-mainnet".to_string(),
        whitelist_path,
        cu_pricing_path,
        config_ttl_secs: 0,
        paid_threshold: 1_000_000,
        network_override: Some("eth-mainnet".to_string()),
    }
}

fn config_with(route: RouteConfig, guard: GuardConfig) -> GatewayConfig {
    GatewayConfig {
        redis: RedisConfig {
            url: redis_url(),
            pool_size: 4,
            allow_degradation: true,
        },
        guard,
        routes: vec![route],
        max_ws_frame_bytes: 65_535,
        upstream_timeout_secs: 5,
        consumers: Vec::new(),
        upstreams: Vec::new(),
    }
}

/// A single-shot TCP listener that answers every connection with the same
/// canned JSON-RPC result, ignoring the request bytes entirely.
async fn spawn_echo_upstream() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let body = br#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body).await;
        }
    });

    addr
}

#[tokio::test]
#[ignore = "requires a reachable redis instance"]
async fn happy_path_is_forwarded_and_gets_rate_limit_headers() {
    let dir = fixture_dir();
    let route = eth_mainnet_route(&dir);
    let config = config_with(route.clone(), GuardConfig::default());

    let upstream_addr = spawn_echo_upstream().await;
    let authenticator = Arc::new(FixedConsumer(Consumer::new("alice", 100, 0, 1_000_000)));
    let upstream_picker = Arc::new(SingleUpstream(UpstreamTarget {
        scheme: UpstreamScheme::Http,
        host: "127.0.0.1".to_string(),
        port: upstream_addr.port(),
        read_timeout: Duration::from_secs(5),
    }));

    let app = GatewayApp::spawn(config, authenticator, upstream_picker).await.unwrap();

    let body = Bytes::from_static(br#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#);
    let response = app
        .handle_http_rpc(
            &route,
            Consumer::new("alice", 100, 0, 1_000_000),
            "127.0.0.1".parse().unwrap(),
            "eth-mainnet.example.com",
            body,
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-limit"));
    assert!(response.headers().contains_key("x-ratelimit-remaining"));

    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
#[ignore = "requires a reachable redis instance"]
async fn whitelist_rejection_never_reaches_the_upstream() {
    let dir = fixture_dir();
    let route = eth_mainnet_route(&dir);
    let config = config_with(route.clone(), GuardConfig::default());

    let authenticator = Arc::new(FixedConsumer(Consumer::new("alice", 100, 0, 1_000_000)));
    let app = GatewayApp::spawn(config, authenticator, Arc::new(UnreachableUpstream)).await.unwrap();

    let body = Bytes::from_static(br#"{"jsonrpc":"2.0","method":"debug_traceTransaction","id":1}"#);
    let response = app
        .handle_http_rpc(
            &route,
            Consumer::new("alice", 100, 0, 1_000_000),
            "127.0.0.1".parse().unwrap(),
            "eth-mainnet.example.com",
            body,
        )
        .await;

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get("x-error-code").unwrap(), "-32003");

    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
#[ignore = "requires a reachable redis instance"]
async fn guard_block_short_circuits_before_parsing_or_forwarding() {
    let dir = fixture_dir();
    let route = eth_mainnet_route(&dir);
    let guard = GuardConfig {
        enabled: true,
        blocked_ips: vec!["10.0.0.0/24".parse().unwrap()],
        blocked_consumers: Default::default(),
        blocked_methods: Vec::new(),
        block_message: "blocked".to_string(),
    };
    let config = config_with(route.clone(), guard);

    let authenticator = Arc::new(FixedConsumer(Consumer::new("alice", 100, 0, 1_000_000)));
    let app = GatewayApp::spawn(config, authenticator, Arc::new(UnreachableUpstream)).await.unwrap();

    let body = Bytes::from_static(br#"{"jsonrpc":"2.0","method":"eth_blockNumber","id":1}"#);
    let response = app
        .handle_http_rpc(
            &route,
            Consumer::new("alice", 100, 0, 1_000_000),
            "10.0.0.5".parse().unwrap(),
            "eth-mainnet.example.com",
            body,
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers().get("x-error-code").unwrap(), "-32003");

    std::fs::remove_dir_all(dir).ok();
}
