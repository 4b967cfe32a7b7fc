//! Request/reply payloads carried inside bus [`Message`](obsflow_bus::Message)s.
//!
//! The request's subject is the method name; correlation is by the
//! `reply_to` destination, which is unique per call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of a successful reply.
pub const STATUS_OK: &str = "OK";

/// Status the service side uses for every failure.
pub const STATUS_ERROR: &str = "ERROR";

/// Prefix of per-call reply destinations.
pub const REPLY_PREFIX: &str = "reply.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub reply_to: String,
    pub has_args: bool,
    pub has_kwargs: bool,
    #[serde(default)]
    pub content: Value,
}

impl RpcRequest {
    pub fn new(reply_to: impl Into<String>, args: &RpcArgs) -> Self {
        Self {
            reply_to: reply_to.into(),
            has_args: !args.args.is_empty(),
            has_kwargs: !args.kwargs.is_empty(),
            content: args.to_content(),
        }
    }

    /// Rebuild the call arguments from the shape flags.
    pub fn args(&self) -> RpcArgs {
        RpcArgs::from_content(self.has_args, self.has_kwargs, &self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub status: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl RpcReply {
    pub fn ok(content: Value) -> Self {
        Self {
            status: STATUS_OK.into(),
            content,
            errmsg: None,
            backtrace: None,
        }
    }

    pub fn error(errmsg: impl Into<String>, backtrace: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.into(),
            content: Value::Null,
            errmsg: Some(errmsg.into()),
            backtrace: Some(backtrace.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Positional and keyword arguments of a call.
///
/// ```
/// use obsflow_rpc::RpcArgs;
///
/// let args = RpcArgs::new().kwarg("OtdbID", 42).kwarg("NewStatus", "queued");
/// assert_eq!(args.get("OtdbID", 0).and_then(|v| v.as_i64()), Some(42));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl RpcArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Look an argument up by keyword, falling back to its position.
    pub fn get(&self, name: &str, position: usize) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(position))
    }

    /// `{args, kwargs}` when both are present, the bare list or map when only
    /// one is, `null` when neither.
    pub fn to_content(&self) -> Value {
        match (self.args.is_empty(), self.kwargs.is_empty()) {
            (false, false) => serde_json::json!({
                "args": self.args,
                "kwargs": self.kwargs,
            }),
            (false, true) => Value::Array(self.args.clone()),
            (true, false) => Value::Object(self.kwargs.clone()),
            (true, true) => Value::Null,
        }
    }

    pub fn from_content(has_args: bool, has_kwargs: bool, content: &Value) -> Self {
        let list = |v: Option<&Value>| match v {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
        let map = |v: Option<&Value>| match v {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        match (has_args, has_kwargs) {
            (true, true) => Self {
                args: list(content.get("args")),
                kwargs: map(content.get("kwargs")),
            },
            (true, false) => Self {
                args: list(Some(content)),
                kwargs: Map::new(),
            },
            (false, true) => Self {
                args: Vec::new(),
                kwargs: map(Some(content)),
            },
            (false, false) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_shape_follows_argument_kinds() {
        assert_eq!(RpcArgs::new().to_content(), Value::Null);
        assert_eq!(RpcArgs::new().arg(1).arg("x").to_content(), json!([1, "x"]));
        assert_eq!(
            RpcArgs::new().kwarg("OtdbID", 42).to_content(),
            json!({"OtdbID": 42})
        );
        assert_eq!(
            RpcArgs::new().arg(1).kwarg("k", true).to_content(),
            json!({"args": [1], "kwargs": {"k": true}})
        );
    }

    #[test]
    fn request_flags_rebuild_arguments() {
        let args = RpcArgs::new().arg(7).kwarg("NewStatus", "queued");
        let req = RpcRequest::new("reply.abc", &args);
        assert!(req.has_args && req.has_kwargs);
        assert_eq!(req.args(), args);

        // A kwargs-only call whose map happens to have an "args" key.
        let tricky = RpcArgs::new().kwarg("args", json!([1, 2]));
        let req = RpcRequest::new("reply.def", &tricky);
        assert_eq!(req.args(), tricky);
    }

    #[test]
    fn keyword_lookup_falls_back_to_position() {
        let args = RpcArgs::new().arg(42).arg("aborted");
        assert_eq!(args.get("OtdbID", 0), Some(&json!(42)));
        assert_eq!(args.get("NewStatus", 1), Some(&json!("aborted")));
        assert_eq!(args.get("Missing", 5), None);
    }

    #[test]
    fn error_reply_omits_nothing_needed() {
        let reply = RpcReply::error("RPCException", "boom");
        let bytes = rmp_serde::to_vec_named(&reply).unwrap();
        let back: RpcReply = rmp_serde::from_slice(&bytes).unwrap();
        assert!(!back.is_ok());
        assert_eq!(back.errmsg.as_deref(), Some("RPCException"));
        assert_eq!(back.backtrace.as_deref(), Some("boom"));
        assert_eq!(back.content, Value::Null);
    }
}
