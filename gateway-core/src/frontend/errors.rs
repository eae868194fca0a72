//! Frontend-level error plumbing: the 404 fallback and turning an
//! authentication rejection into a response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::instrument;

use crate::consumer::AuthRejection;
use crate::jsonrpc::{error_response, JsonRpcId};

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = error_response(-32000, self.message, &JsonRpcId::null());
        let mut response = (self.status, body).into_response();
        response
            .headers_mut()
            .insert("content-type", "application/json".parse().unwrap());
        response
    }
}

#[instrument(level = "trace")]
pub async fn handler_404() -> Response {
    let body = error_response(-32601, "not found", &JsonRpcId::null());
    let mut response = (StatusCode::NOT_FOUND, body).into_response();
    response
        .headers_mut()
        .insert("content-type", "application/json".parse().unwrap());
    response
}
