// Stratum wire protocol types.
//
// The protocol is newline-delimited JSON: each line is one object.
// Requests carry {id, method, params}, responses {id, result, error},
// and server-pushed notifications reuse the request shape with a null id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EXTRA_NONCE2_SIZE;

/// Parse error: the line was not valid JSON
pub const ERR_PARSE: i32 = -32700;

/// The object had none of method / result / error
pub const ERR_INVALID_REQUEST: i32 = -32600;

/// Method is not part of the mining protocol
pub const ERR_UNKNOWN_METHOD: i32 = -32601;

/// Submit parameters missing or malformed
pub const ERR_INVALID_PARAMS: i32 = 20;

/// Share did not meet the session difficulty or failed validation
pub const ERR_INVALID_SHARE: i32 = 23;

/// Worker is not authorized, or credentials were rejected
pub const ERR_UNAUTHORIZED: i32 = 24;

/// Incoming message, decoded leniently so the server can classify
/// malformed traffic instead of dropping the connection.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    /// Request id, echoed back in the response. Notifications use null.
    #[serde(default)]
    pub id: Option<Value>,

    /// Method name for requests and notifications
    #[serde(default)]
    pub method: Option<String>,

    /// Positional parameters
    #[serde(default)]
    pub params: Option<Vec<Value>>,

    /// Present when the message is a response
    #[serde(default)]
    pub result: Option<Value>,

    /// Present when the message is an error response
    #[serde(default)]
    pub error: Option<Value>,
}

impl RpcMessage {
    /// A message must carry at least one of method / result / error
    /// to be a well-formed frame.
    pub fn is_well_formed(&self) -> bool {
        self.method.is_some() || self.result.is_some() || self.error.is_some()
    }

    /// Positional parameters, empty slice when absent
    pub fn params(&self) -> &[Value] {
        self.params.as_deref().unwrap_or(&[])
    }
}

/// Outgoing response frame
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<StratumError>,
}

impl RpcResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<Value>, error: StratumError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Server-pushed notification: same shape as a request, null id
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    /// Always serialized as null
    pub id: Option<u64>,

    /// Method name, e.g. "mining.set_difficulty"
    pub method: String,

    /// Notification payload
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// `mining.set_difficulty` push for a session
    pub fn set_difficulty(difficulty: f64) -> Self {
        Self::new("mining.set_difficulty", serde_json::json!([difficulty]))
    }

    /// `mining.notify` push carrying a pool-supplied job payload
    pub fn notify(params: Value) -> Self {
        Self::new("mining.notify", params)
    }
}

/// Stratum error triple, serialized as `[code, message, null]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumError(pub i32, pub String, pub Option<Value>);

impl StratumError {
    /// Create a new stratum error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self(code, message.into(), None)
    }

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn message(&self) -> &str {
        &self.1
    }

    pub fn parse_error() -> Self {
        Self::new(ERR_PARSE, "Invalid JSON")
    }

    pub fn invalid_request() -> Self {
        Self::new(ERR_INVALID_REQUEST, "Invalid message format")
    }

    pub fn unknown_method() -> Self {
        Self::new(ERR_UNKNOWN_METHOD, "Unknown method")
    }

    pub fn invalid_params() -> Self {
        Self::new(ERR_INVALID_PARAMS, "Invalid share parameters")
    }

    pub fn invalid_share() -> Self {
        Self::new(ERR_INVALID_SHARE, "Invalid share")
    }

    pub fn unauthorized() -> Self {
        Self::new(ERR_UNAUTHORIZED, "Unauthorized worker")
    }
}

/// One submitted unit of proof-of-work, as parsed off the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    /// Worker name the session authorized as
    pub worker: String,

    /// Job the share was mined against
    pub job_id: String,

    /// Miner-chosen nonce extension (hex)
    pub extra_nonce2: String,

    /// Block time field (hex)
    pub ntime: String,

    /// Nonce (hex)
    pub nonce: String,

    /// Session difficulty the share was accepted at.
    /// This is the weight the ledger credits for it.
    pub difficulty: f64,
}

/// Build the `mining.subscribe` result triple: the notification channel
/// pairs, the subscription id, and the extra-nonce-2 width.
pub fn subscribe_result(subscription_id: &str) -> Value {
    serde_json::json!([
        [
            ["mining.set_difficulty", subscription_id],
            ["mining.notify", subscription_id]
        ],
        subscription_id,
        EXTRA_NONCE2_SIZE
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_triple_serialization() {
        let err = StratumError::invalid_share();
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"[23,"Invalid share",null]"#);
    }

    #[test]
    fn test_response_shapes() {
        let ok = RpcResponse::ok(Some(Value::from(1)), Value::Bool(true));
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"id":1,"result":true,"error":null}"#
        );

        let err = RpcResponse::err(Some(Value::from(2)), StratumError::unauthorized());
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"id":2,"result":null,"error":[24,"Unauthorized worker",null]}"#
        );
    }

    #[test]
    fn test_notification_has_null_id() {
        let notif = RpcNotification::set_difficulty(32.0);
        let json = serde_json::to_string(&notif).unwrap();
        assert!(json.starts_with(r#"{"id":null,"method":"mining.set_difficulty""#));
    }

    #[test]
    fn test_lenient_decode() {
        let msg: RpcMessage =
            serde_json::from_str(r#"{"id":1,"method":"mining.subscribe","params":[]}"#).unwrap();
        assert!(msg.is_well_formed());
        assert_eq!(msg.method.as_deref(), Some("mining.subscribe"));
        assert!(msg.params().is_empty());

        let junk: RpcMessage = serde_json::from_str(r#"{"id":5}"#).unwrap();
        assert!(!junk.is_well_formed());
    }

    #[test]
    fn test_subscribe_result_shape() {
        let result = subscribe_result("abc123");
        let arr = result.as_array().unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr[1], "abc123");
        assert_eq!(arr[2], 8);
    }
}
