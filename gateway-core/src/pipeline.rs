//! The ordered composition of stages every HTTP request traverses: guard ->
//! parse -> whitelist -> CU -> monthly quota -> rate limit -> forward
//! (spec.md 4.8). Re-architected per spec.md 9's "tagged result" note: each
//! stage is a function over [`RequestContext`] that either continues or
//! terminates the request with a response, instead of the source's mixed
//! `ngx.exit`-vs-return-status propagation.

use axum::http::HeaderValue;
use axum::response::Response;

/// What a pipeline stage decided. `Terminate` carries the exact response to
/// send; the terminal handler issues it exactly once and runs no further
/// stages.
pub enum PipelineOutcome {
    Continue,
    Terminate(Response),
}

impl PipelineOutcome {
    pub fn is_terminate(&self) -> bool {
        matches!(self, Self::Terminate(_))
    }
}

/// Always present on a rate-limited path (spec.md 6), win or lose.
pub fn apply_rate_limit_headers(response: &mut Response, limit: i64, remaining: i64, window_ms: i64) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", header_value(limit));
    headers.insert("x-ratelimit-remaining", header_value(remaining.max(0)));
    headers.insert(
        "x-ratelimit-window",
        header_value((window_ms as f64 / 1000.0).ceil() as i64),
    );
    headers.insert("x-ratelimit-type", HeaderValue::from_static("sliding"));
}

/// Always present on a quota-checked path (spec.md 6), win or lose.
pub fn apply_monthly_quota_headers(response: &mut Response, quota: i64, used: i64, remaining: i64) {
    let headers = response.headers_mut();
    headers.insert("x-monthly-quota", header_value(quota));
    headers.insert("x-monthly-used", header_value(used));
    headers.insert("x-monthly-remaining", header_value(remaining.max(0)));
}

fn header_value(n: i64) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).expect("integers always format as valid header values")
}

/// Drains an HTTP-pipeline response back down to its JSON-RPC body bytes,
/// so the WebSocket per-message pipeline can reuse the exact same stage
/// functions and just forward the error body as a text frame instead.
pub async fn response_body_bytes(response: Response) -> Vec<u8> {
    hyper::body::to_bytes(response.into_body())
        .await
        .map(|bytes| bytes.to_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn rate_limit_headers_are_always_set() {
        let mut response = ().into_response();
        apply_rate_limit_headers(&mut response, 100, 99, 1000);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "99");
        assert_eq!(response.headers().get("x-ratelimit-type").unwrap(), "sliding");
    }

    #[test]
    fn quota_headers_are_always_set() {
        let mut response = ().into_response();
        apply_monthly_quota_headers(&mut response, 10000, 1, 9999);
        assert_eq!(response.headers().get("x-monthly-quota").unwrap(), "10000");
        assert_eq!(response.headers().get("x-monthly-remaining").unwrap(), "9999");
    }
}
