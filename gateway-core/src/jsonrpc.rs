//! JSON-RPC 2.0 codec: parse single/batch request bodies with per-index
//! error tracking, and build well-formed error response envelopes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

pub const MAX_BODY_BYTES: usize = 1024 * 1024;
pub const MAX_BATCH_SIZE: usize = 100;

/// A JSON-RPC id, preserved byte-for-byte so large numeric ids never lose
/// precision round-tripping through this layer. `None` covers both a
/// missing `id` field and an explicit JSON `null` -- the wire format makes
/// no distinction once it reaches an error response either way.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct JsonRpcId(#[serde(default)] pub Option<Box<RawValue>>);

impl JsonRpcId {
    pub fn null() -> Self {
        JsonRpcId(None)
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => JsonRpcId(None),
            other => {
                let raw = serde_json::to_string(other).unwrap_or_else(|_| "null".to_string());
                JsonRpcId(RawValue::from_string(raw).ok())
            }
        }
    }

    /// What actually gets written into a response envelope: the preserved
    /// raw id, or an explicit `null`.
    pub fn as_response_value(&self) -> &RawValue {
        static NULL: Lazy<Box<RawValue>> =
            Lazy::new(|| RawValue::from_string("null".to_string()).unwrap());
        self.0.as_deref().unwrap_or(&NULL)
    }
}

/// A single JSON-RPC request object, used by typed callers (tests, the
/// WebSocket proxy) that want a first-class single-vs-batch type instead of
/// going through the index-tracking [`parse`] path.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcSingleRequest {
    #[serde(default = "default_jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: JsonRpcId,
}

fn default_jsonrpc_version() -> String {
    "2.0".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum JsonRpcRequestEnum {
    Single(JsonRpcSingleRequest),
    Batch(Vec<JsonRpcSingleRequest>),
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorData {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorResponse<'a> {
    pub jsonrpc: &'static str,
    pub id: &'a RawValue,
    pub error: JsonRpcErrorData,
}

/// Everything the pipeline needs from a parsed request body.
///
/// Invariant: `methods.len() == ids.len() == count`, in both strict and
/// partial mode -- a tombstoned index still occupies a slot.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub is_batch: bool,
    pub methods: Vec<String>,
    pub ids: Vec<JsonRpcId>,
    pub count: usize,
    pub per_index_errors: Option<Vec<Option<String>>>,
    pub raw_decoded: Value,
}

impl ParsedRequest {
    /// Methods that are real (not a partial-parse tombstone), paired with
    /// their index in the original batch.
    pub fn live_methods(&self) -> impl Iterator<Item = (usize, &str)> {
        self.methods.iter().enumerate().filter_map(|(i, m)| {
            let tombstoned = self
                .per_index_errors
                .as_ref()
                .and_then(|errs| errs.get(i))
                .map(|e| e.is_some())
                .unwrap_or(false);
            if tombstoned {
                None
            } else {
                Some((i, m.as_str()))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    EmptyBody,
    BodyTooLarge,
    ParseError(String),
    EmptyBatch,
    BatchTooLarge,
    InvalidRequestAt { index: usize, reason: String },
    InvalidRequest(String),
}

impl ParseErrorKind {
    /// spec.md 4.1: "every parse failure maps to one JSON-RPC code -- parse
    /// error or empty batch -> -32700 / -32600; missing/invalid method ->
    /// -32600".
    pub fn code(&self) -> i64 {
        match self {
            Self::EmptyBody | Self::ParseError(_) => -32700,
            Self::BodyTooLarge
            | Self::EmptyBatch
            | Self::BatchTooLarge
            | Self::InvalidRequestAt { .. }
            | Self::InvalidRequest(_) => -32600,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::EmptyBody => "empty body".to_string(),
            Self::BodyTooLarge => "body too large".to_string(),
            Self::ParseError(reason) => format!("parse error: {reason}"),
            Self::EmptyBatch => "empty batch".to_string(),
            Self::BatchTooLarge => "batch too large".to_string(),
            Self::InvalidRequestAt { index, reason } => {
                format!("invalid request at index {index}: {reason}")
            }
            Self::InvalidRequest(reason) => reason.clone(),
        }
    }
}

fn validate_single(value: &Value) -> Result<(String, JsonRpcId), (String, JsonRpcId)> {
    let id = value
        .as_object()
        .and_then(|o| o.get("id"))
        .map(JsonRpcId::from_value)
        .unwrap_or_else(JsonRpcId::null);

    let Some(obj) = value.as_object() else {
        return Err(("must be object".to_string(), id));
    };

    match obj.get("method").and_then(Value::as_str) {
        Some(method) if !method.is_empty() => Ok((method.to_string(), id)),
        _ => Err(("method must be non-empty string".to_string(), id)),
    }
}

/// Parses a JSON-RPC request body, single object or batch array.
///
/// In strict mode the first invalid element fails the whole batch. In
/// partial mode the offending index is recorded in `per_index_errors` and
/// the corresponding `methods` slot is a tombstone (an empty string, never
/// counted for CU or rate-limit).
pub fn parse(body: &[u8], allow_partial: bool) -> Result<ParsedRequest, ParseErrorKind> {
    if body.is_empty() {
        return Err(ParseErrorKind::EmptyBody);
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(ParseErrorKind::BodyTooLarge);
    }

    let decoded: Value =
        serde_json::from_slice(body).map_err(|e| ParseErrorKind::ParseError(e.to_string()))?;

    match &decoded {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(ParseErrorKind::EmptyBatch);
            }
            if items.len() > MAX_BATCH_SIZE {
                return Err(ParseErrorKind::BatchTooLarge);
            }

            let mut methods = Vec::with_capacity(items.len());
            let mut ids = Vec::with_capacity(items.len());
            let mut per_index_errors: Vec<Option<String>> = Vec::with_capacity(items.len());

            for (index, item) in items.iter().enumerate() {
                match validate_single(item) {
                    Ok((method, id)) => {
                        methods.push(method);
                        ids.push(id);
                        per_index_errors.push(None);
                    }
                    Err((reason, id)) => {
                        if !allow_partial {
                            return Err(ParseErrorKind::InvalidRequestAt { index, reason });
                        }
                        methods.push(String::new());
                        ids.push(id);
                        per_index_errors.push(Some(reason));
                    }
                }
            }

            Ok(ParsedRequest {
                is_batch: true,
                methods,
                ids,
                count: items.len(),
                per_index_errors: Some(per_index_errors),
                raw_decoded: decoded,
            })
        }
        Value::Object(_) => match validate_single(&decoded) {
            Ok((method, id)) => Ok(ParsedRequest {
                is_batch: false,
                methods: vec![method],
                ids: vec![id],
                count: 1,
                per_index_errors: None,
                raw_decoded: decoded,
            }),
            Err((reason, _id)) => Err(ParseErrorKind::InvalidRequest(reason)),
        },
        _ => Err(ParseErrorKind::InvalidRequest(
            "must be an object or an array".to_string(),
        )),
    }
}

/// Always a well-formed JSON-RPC 2.0 error envelope. Never panics on bad
/// input -- callers only ever feed it ids/messages they already control.
pub fn error_response(code: i64, message: impl Into<String>, id: &JsonRpcId) -> Vec<u8> {
    let response = JsonRpcErrorResponse {
        jsonrpc: "2.0",
        id: id.as_response_value(),
        error: JsonRpcErrorData {
            code,
            message: message.into(),
        },
    };
    serde_json::to_vec(&response).expect("error envelope always serializes")
}

/// One error object per id, preserving order -- used when a whole batch is
/// rejected but each original id still needs an individual reply.
pub fn batch_error_response(code: i64, message: &str, ids: &[JsonRpcId]) -> Vec<u8> {
    let responses: Vec<JsonRpcErrorResponse> = ids
        .iter()
        .map(|id| JsonRpcErrorResponse {
            jsonrpc: "2.0",
            id: id.as_response_value(),
            error: JsonRpcErrorData {
                code,
                message: message.to_string(),
            },
        })
        .collect();
    serde_json::to_vec(&responses).expect("error envelope always serializes")
}

static UNIFRA_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^.]+)\.unifra\.io$").unwrap());

/// `{name}.unifra.io` first, else the first dot-separated segment, else
/// `None` -- a deliberate fail-closed default (spec.md 9, Open Questions).
pub fn extract_network(host: &str) -> Option<String> {
    if let Some(caps) = UNIFRA_HOST.captures(host) {
        return Some(caps[1].to_string());
    }

    match host.split_once('.') {
        Some((first, _rest)) if !first.is_empty() => Some(first.to_string()),
        _ => None,
    }
}

/// Re-exported so C1's `match_method` operation and C3's whitelist wildcard
/// matching stay a single implementation instead of two copies drifting
/// apart.
pub use deferred_rate_limiter::whitelist::match_method;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_rejected() {
        assert_eq!(parse(b"", false), Err(ParseErrorKind::EmptyBody));
    }

    #[test]
    fn body_over_one_mib_is_rejected() {
        let body = vec![b' '; MAX_BODY_BYTES + 1];
        assert_eq!(parse(&body, false), Err(ParseErrorKind::BodyTooLarge));
    }

    #[test]
    fn single_object_round_trips_counts() {
        let body = br#"{"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}"#;
        let parsed = parse(body, false).unwrap();
        assert!(!parsed.is_batch);
        assert_eq!(parsed.count, 1);
        assert_eq!(parsed.methods.len(), parsed.ids.len());
        assert_eq!(parsed.methods[0], "eth_blockNumber");
    }

    #[test]
    fn batch_of_three_preserves_order_and_lengths() {
        let body = br#"[
            {"jsonrpc":"2.0","method":"eth_blockNumber","id":1},
            {"jsonrpc":"2.0","method":"eth_chainId","id":2},
            {"jsonrpc":"2.0","method":"eth_gasPrice","id":3}
        ]"#;
        let parsed = parse(body, false).unwrap();
        assert!(parsed.is_batch);
        assert_eq!(parsed.count, 3);
        assert_eq!(parsed.methods.len(), 3);
        assert_eq!(parsed.ids.len(), 3);
        assert_eq!(parsed.methods, vec!["eth_blockNumber", "eth_chainId", "eth_gasPrice"]);
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert_eq!(parse(b"[]", false), Err(ParseErrorKind::EmptyBatch));
    }

    #[test]
    fn batch_of_101_is_rejected() {
        let items: Vec<String> = (0..101)
            .map(|i| format!(r#"{{"jsonrpc":"2.0","method":"eth_chainId","id":{i}}}"#))
            .collect();
        let body = format!("[{}]", items.join(","));
        assert_eq!(parse(body.as_bytes(), false), Err(ParseErrorKind::BatchTooLarge));
    }

    #[test]
    fn batch_of_100_is_accepted() {
        let items: Vec<String> = (0..100)
            .map(|i| format!(r#"{{"jsonrpc":"2.0","method":"eth_chainId","id":{i}}}"#))
            .collect();
        let body = format!("[{}]", items.join(","));
        let parsed = parse(body.as_bytes(), false).unwrap();
        assert_eq!(parsed.count, 100);
    }

    #[test]
    fn strict_mode_fails_whole_batch_on_first_bad_element() {
        let body = br#"[
            {"jsonrpc":"2.0","method":"eth_blockNumber","id":1},
            {"jsonrpc":"2.0","id":2}
        ]"#;
        let err = parse(body, false).unwrap_err();
        assert_eq!(
            err,
            ParseErrorKind::InvalidRequestAt {
                index: 1,
                reason: "method must be non-empty string".to_string()
            }
        );
    }

    #[test]
    fn partial_mode_tombstones_the_bad_index_and_keeps_the_rest() {
        let body = br#"[
            {"jsonrpc":"2.0","method":"eth_blockNumber","id":1},
            {"jsonrpc":"2.0","id":2},
            {"jsonrpc":"2.0","method":"eth_chainId","id":3}
        ]"#;
        let parsed = parse(body, true).unwrap();
        assert_eq!(parsed.count, 3);
        assert_eq!(parsed.methods, vec!["eth_blockNumber", "", "eth_chainId"]);
        let errors = parsed.per_index_errors.unwrap();
        assert!(errors[0].is_none());
        assert_eq!(errors[1].as_deref(), Some("method must be non-empty string"));
        assert!(errors[2].is_none());
    }

    #[test]
    fn missing_id_renders_as_explicit_null() {
        let id = JsonRpcId::null();
        assert_eq!(id.as_response_value().get(), "null");
    }

    #[test]
    fn error_response_is_well_formed_json_rpc() {
        let bytes = error_response(-32700, "parse error: boom", &JsonRpcId::null());
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], -32700);
    }

    #[test]
    fn extract_network_prefers_unifra_suffix() {
        assert_eq!(
            extract_network("eth-mainnet.unifra.io"),
            Some("eth-mainnet".to_string())
        );
    }

    #[test]
    fn extract_network_falls_back_to_first_segment() {
        assert_eq!(
            extract_network("eth-mainnet.example.com"),
            Some("eth-mainnet".to_string())
        );
    }

    #[test]
    fn extract_network_is_none_without_a_dot() {
        assert_eq!(extract_network("localhost"), None);
    }

    #[test]
    fn match_method_supports_exact_and_prefix_wildcard() {
        assert!(match_method("eth_call", "eth_call"));
        assert!(match_method("debug_traceTransaction", "debug_*"));
        assert!(!match_method("eth_call", "debug_*"));
    }
}
