//! HTTP and WebSocket entry points. Everything past admission control lives
//! in `app::GatewayApp`; these modules only adapt axum's extractors to it.

pub mod errors;
pub mod http_proxy;
pub mod websocket_proxy;
