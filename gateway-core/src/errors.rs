//! Error handling for the gateway core (spec.md 7): a single
//! `derive_more`-based enum, mirroring the teacher's `Web3ProxyError` --
//! one variant per failure class, and a response mapping that keeps
//! gateway-class and business-class errors on their documented status
//! codes.

use crate::jsonrpc::{error_response, JsonRpcId};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use derive_more::{Display, Error, From};
use std::borrow::Cow;
use tracing::{trace, warn};

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every failure the pipeline can produce. Business-class variants (parse,
/// whitelist, business JSON-RPC errors) always respond 200 with a JSON-RPC
/// error body; gateway-class variants (guard, quota, rate limit, internal)
/// use the matching HTTP status -- spec.md 7.
#[derive(Debug, Display, Error, From)]
pub enum GatewayError {
    /// Business-class: malformed/invalid JSON-RPC body. HTTP 200.
    #[display(fmt = "{message}")]
    #[error(ignore)]
    #[from(ignore)]
    JsonRpcParse {
        code: i64,
        message: Cow<'static, str>,
        id: JsonRpcId,
    },

    /// Business-class: unsupported network/method, or free tier hitting a
    /// paid-only method. HTTP 405.
    #[display(fmt = "{message}")]
    #[error(ignore)]
    #[from(ignore)]
    WhitelistRejected {
        code: i64,
        message: Cow<'static, str>,
        id: JsonRpcId,
    },

    /// Gateway-class: guard block list hit. HTTP 403, JSON-RPC -32003.
    #[display(fmt = "{message}")]
    #[error(ignore)]
    #[from(ignore)]
    GuardBlocked {
        message: Cow<'static, str>,
        id: JsonRpcId,
    },

    /// Gateway-class: monthly CU quota exhausted. HTTP 429, JSON-RPC -32001.
    #[display(fmt = "monthly quota exceeded")]
    #[error(ignore)]
    #[from(ignore)]
    QuotaExceeded { id: JsonRpcId },

    /// Gateway-class: sliding-window CU limit exhausted. HTTP 429,
    /// JSON-RPC -32000.
    #[display(fmt = "rate limit exceeded")]
    #[error(ignore)]
    #[from(ignore)]
    RateLimitExceeded {
        id: JsonRpcId,
        retry_after_secs: u64,
    },

    /// Gateway-class: monthly quota is fail-closed and Redis is
    /// unavailable. HTTP 503, JSON-RPC -32603.
    #[display(fmt = "monthly quota service unavailable")]
    #[error(ignore)]
    QuotaServiceUnavailable,

    /// Gateway-class: rate limiter is fail-closed and Redis is
    /// unavailable. HTTP 503, JSON-RPC -32603.
    #[display(fmt = "rate limiting service unavailable")]
    #[error(ignore)]
    RateLimitServiceUnavailable,

    /// Mandatory config (e.g. whitelist) failed to load and there is no
    /// stale snapshot to fall back to. HTTP 503.
    #[display(fmt = "{_0}")]
    #[error(ignore)]
    #[from(ignore)]
    ConfigUnavailable(Cow<'static, str>),

    #[display(fmt = "{_0}")]
    Redis(redis_rate_limiter::redis::RedisError),

    #[display(fmt = "{_0}")]
    RedisPool(redis_rate_limiter::RedisPoolError),

    #[display(fmt = "{_0}")]
    #[error(ignore)]
    Anyhow(anyhow::Error),

    /// Anything else: logged and turned into -32603 / 500.
    #[display(fmt = "{_0}")]
    #[error(ignore)]
    #[from(ignore)]
    Internal(Cow<'static, str>),
}

/// spec.md 4.8: `unsupported network` -> -32600, `requires paid` -> -32003,
/// `unsupported method` -> -32601.
pub fn whitelist_denial_code(denial: &deferred_rate_limiter::WhitelistDenial) -> i64 {
    use deferred_rate_limiter::WhitelistDenial;
    match denial {
        WhitelistDenial::UnsupportedNetwork => -32600,
        WhitelistDenial::RequiresPaidTier { .. } => -32003,
        WhitelistDenial::UnsupportedMethod { .. } => -32601,
    }
}

impl GatewayError {
    pub fn as_response_parts(&self) -> (StatusCode, i64, Cow<'static, str>, &JsonRpcId) {
        static NULL_ID: JsonRpcId = JsonRpcId(None);

        match self {
            Self::JsonRpcParse { code, message, id } => {
                trace!(%code, %message, "json-rpc parse error");
                (StatusCode::OK, *code, message.clone(), id)
            }
            Self::WhitelistRejected { code, message, id } => {
                (StatusCode::METHOD_NOT_ALLOWED, *code, message.clone(), id)
            }
            Self::GuardBlocked { message, id } => {
                (StatusCode::FORBIDDEN, -32003, message.clone(), id)
            }
            Self::QuotaExceeded { id } => (
                StatusCode::TOO_MANY_REQUESTS,
                -32001,
                Cow::Borrowed("quota exceeded"),
                id,
            ),
            Self::RateLimitExceeded { id, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                -32000,
                Cow::Borrowed("rate limit exceeded"),
                id,
            ),
            Self::QuotaServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                -32603,
                Cow::Borrowed("monthly quota service unavailable"),
                &NULL_ID,
            ),
            Self::RateLimitServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                -32603,
                Cow::Borrowed("rate limiting service unavailable"),
                &NULL_ID,
            ),
            Self::ConfigUnavailable(message) => {
                warn!(%message, "config unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, -32603, message.clone(), &NULL_ID)
            }
            Self::Redis(err) => {
                warn!(?err, "redis error reached the response layer");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    -32603,
                    Cow::Owned(err.to_string()),
                    &NULL_ID,
                )
            }
            Self::RedisPool(err) => {
                warn!(?err, "redis pool error reached the response layer");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    -32603,
                    Cow::Owned(err.to_string()),
                    &NULL_ID,
                )
            }
            Self::Anyhow(err) => {
                warn!(?err, "unhandled error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    -32603,
                    Cow::Owned(err.to_string()),
                    &NULL_ID,
                )
            }
            Self::Internal(message) => {
                warn!(%message, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, -32603, message.clone(), &NULL_ID)
            }
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code, message, id) = self.as_response_parts();
        let body = error_response(code, message.into_owned(), id);
        let retry_after = self.retry_after_secs();

        let mut response = (status, body).into_response();
        response
            .headers_mut()
            .insert("content-type", "application/json".parse().unwrap());
        response
            .headers_mut()
            .insert("x-error-code", code.to_string().parse().unwrap());
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("retry-after", secs.to_string().parse().unwrap());
        }
        response
    }
}
