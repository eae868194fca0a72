//! HTTP entry point: resolves the route, authenticates the caller, and
//! hands everything else to `GatewayApp::handle_http_rpc`.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_client_ip::ClientIp;
use bytes::Bytes;

use crate::app::GatewayApp;
use crate::errors::GatewayError;

pub async fn proxy_rpc(
    State(app): State<Arc<GatewayApp>>,
    Path(route_id): Path<String>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(route) = app.route(&route_id).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown route").into_response();
    };

    let consumer = match app.authenticator.authenticate(&headers, client_ip).await {
        Ok(consumer) => consumer,
        Err(rejection) => return rejection.into_response(),
    };

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if body.len() > crate::jsonrpc::MAX_BODY_BYTES {
        return GatewayError::JsonRpcParse {
            code: -32600,
            message: Cow::Borrowed("body too large"),
            id: crate::jsonrpc::JsonRpcId::null(),
        }
        .into_response();
    }

    app.handle_http_rpc(&route, consumer, client_ip, host, body).await
}
