//! Per-request state carried between pipeline stages (C10). Created fresh
//! at pipeline entry, exclusive to the one worker handling that request,
//! and discarded after the response is sent -- see spec.md 3, 5, 8.

use crate::consumer::Consumer;
use crate::jsonrpc::{JsonRpcId, ParsedRequest};
use std::time::Instant;

/// Key/value pairs a stage wants attached to this request's structured log
/// line; stages append, nothing ever removes an entry.
pub type LogFields = Vec<(&'static str, String)>;

pub struct RequestContext {
    pub parsed: Option<ParsedRequest>,
    pub consumer: Consumer,
    pub network: Option<String>,
    pub cu: u64,
    pub start: Instant,
    pub log_fields: LogFields,
    /// Connection-scoped nonce reused across every message on one
    /// WebSocket connection; `None` for a plain HTTP request.
    pub connection_nonce: Option<String>,
    /// `(limit, remaining, window_ms)`, set once the rate limit stage runs
    /// (win or lose) so the final response always carries the headers.
    pub rate_limit_headers: Option<(i64, i64, i64)>,
    /// `(quota, used, remaining)`, set once the monthly quota stage runs.
    pub quota_headers: Option<(i64, i64, i64)>,
}

impl RequestContext {
    pub fn new(consumer: Consumer) -> Self {
        Self {
            parsed: None,
            consumer,
            network: None,
            cu: 0,
            start: Instant::now(),
            log_fields: Vec::new(),
            connection_nonce: None,
            rate_limit_headers: None,
            quota_headers: None,
        }
    }

    pub fn for_websocket_message(consumer: Consumer, connection_nonce: String) -> Self {
        let mut ctx = Self::new(consumer);
        ctx.connection_nonce = Some(connection_nonce);
        ctx
    }

    pub fn record(&mut self, key: &'static str, value: impl Into<String>) {
        self.log_fields.push((key, value.into()));
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// The id error responses should echo: the first request's id in a
    /// batch, or an explicit `null` before parsing has happened at all.
    pub fn first_id(&self) -> JsonRpcId {
        self.parsed
            .as_ref()
            .and_then(|p| p.ids.first().cloned())
            .unwrap_or_else(JsonRpcId::null)
    }
}
