//! WebSocket proxy (C9): upgrades the connection after the same
//! guard/authentication admission control as HTTP, then runs two
//! cooperating tasks that forward frames in both directions, applying the
//! JSON-RPC pipeline to each inbound text frame.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum_client_ip::ClientIp;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::warn;

use crate::app::GatewayApp;
use crate::consumer::Consumer;
use crate::config::RouteConfig;
use crate::errors::GatewayError;
use crate::jsonrpc::extract_network;

pub async fn proxy_ws(
    State(app): State<Arc<GatewayApp>>,
    Path(route_id): Path<String>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(route) = app.route(&route_id).cloned() else {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    };

    let consumer = match app.authenticator.authenticate(&headers, client_ip).await {
        Ok(consumer) => consumer,
        Err(rejection) => return rejection.into_response(),
    };

    // Codec and whitelist are bypassed for the handshake (spec.md 4.9);
    // only IP/consumer admission control runs here.
    if app.guard.check_pre_parse(client_ip, &consumer.name) {
        app.metrics.record_guard_block("pre_parse");
        return GatewayError::GuardBlocked {
            message: std::borrow::Cow::Owned(app.guard.block_message().to_string()),
            id: crate::jsonrpc::JsonRpcId::null(),
        }
        .into_response();
    }

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let network = match route.network_override.clone().or_else(|| extract_network(&host)) {
        Some(network) => network,
        None => {
            return GatewayError::WhitelistRejected {
                code: -32600,
                message: std::borrow::Cow::Borrowed("unsupported network"),
                id: crate::jsonrpc::JsonRpcId::null(),
            }
            .into_response();
        }
    };

    ws.max_message_size(app.config.max_ws_frame_bytes)
        .on_upgrade(move |socket| handle_socket(app, route, network, consumer, socket))
}

async fn handle_socket(app: Arc<GatewayApp>, route: RouteConfig, network: String, consumer: Consumer, client_socket: WebSocket) {
    app.metrics.record_websocket_connection();

    let upstream_target = match app.upstream_picker.pick(&route.id, &network).await {
        Ok(target) => target.as_websocket(),
        Err(err) => {
            warn!(%err, route_id = %route.id, network = %network, "no websocket upstream available");
            return;
        }
    };

    let upstream_url = upstream_target.http_url("");
    let connected = tokio::time::timeout(
        upstream_target.read_timeout,
        tokio_tungstenite::connect_async(&upstream_url),
    )
    .await;

    let upstream_socket = match connected {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            warn!(?err, upstream = %upstream_url, "upstream websocket connect failed");
            return;
        }
        Err(_) => {
            warn!(upstream = %upstream_url, "upstream websocket connect timed out");
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream_socket.split();
    let connection_nonce = ulid::Ulid::new().to_string();

    // `client_tx` has exactly one owner: the downstream task. The upstream
    // task never touches the client sink directly -- its pong replies and
    // per-message error frames go through this channel instead, so the two
    // tasks never hold overlapping `&mut` borrows of the same sink.
    let (to_client, mut to_client_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let downstream_app = app.clone();

    let downstream = async move {
        loop {
            tokio::select! {
                message = upstream_rx.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(UpstreamMessage::Text(text)) => {
                            downstream_app.metrics.record_websocket_message("downstream");
                            if client_tx.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Ok(UpstreamMessage::Binary(bytes)) => {
                            if client_tx.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Ok(UpstreamMessage::Ping(payload)) => {
                            if client_tx.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Ok(UpstreamMessage::Pong(_)) => {}
                        Ok(UpstreamMessage::Close(_)) | Err(_) => {
                            let _ = client_tx.send(Message::Close(None)).await;
                            break;
                        }
                        Ok(UpstreamMessage::Frame(_)) => {}
                    }
                }
                relayed = to_client_rx.recv() => {
                    let Some(relayed) = relayed else { break };
                    if client_tx.send(relayed).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let upstream_forward = async move {
        while let Some(message) = client_rx.next().await {
            let message = match message {
                Ok(message) => message,
                Err(_) => break,
            };

            match message {
                Message::Text(text) => {
                    app.metrics.record_websocket_message("upstream");
                    match app
                        .handle_ws_message(&route, &network, &consumer, &connection_nonce, text.as_bytes())
                        .await
                    {
                        Ok(()) => {
                            if upstream_tx.send(UpstreamMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(error_body) => {
                            if let Ok(error_text) = String::from_utf8(error_body) {
                                let _ = to_client.send(Message::Text(error_text));
                            }
                        }
                    }
                }
                Message::Binary(bytes) => {
                    if upstream_tx.send(UpstreamMessage::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Message::Ping(payload) => {
                    let _ = to_client.send(Message::Pong(payload));
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = downstream => {}
        _ = upstream_forward => {}
    }
}
