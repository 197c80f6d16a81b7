//! Per-call context propagation
//!
//! Trace identifiers follow a call chain end to end. The delegate does not: it
//! is read from the outbound pattern's `delegate$` and reaches exactly the
//! handler that call lands on. A nested call issued from inside that handler
//! starts without one unless it supplies its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::types::RequestMessage;
use crate::types::{Pattern, DELEGATE};

/// Trace/correlation identifiers for a whole call chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl Trace {
    /// Start a new chain
    pub fn root() -> Self {
        Self {
            trace_id: new_id(),
            span_id: new_id(),
            parent_span_id: None,
        }
    }

    /// A span for a call issued while handling this one
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_id(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// State of one in-flight call, on either side of the wire
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Correlation id
    pub id: String,
    pub pattern: Pattern,
    pub trace: Trace,
    delegate: Option<Arc<Value>>,
}

impl CallContext {
    /// Context for an outbound call
    ///
    /// `parent` is the inbound call being handled when the call is nested.
    /// Only its trace carries over.
    pub fn outbound(mut pattern: Pattern, parent: Option<&CallContext>) -> Self {
        let delegate = pattern.remove(DELEGATE).filter(|v| !v.is_null()).map(Arc::new);
        Self {
            id: new_id(),
            pattern,
            trace: parent.map_or_else(Trace::root, |p| p.trace.child()),
            delegate,
        }
    }

    /// Context for a call received from the transport
    pub fn inbound(message: RequestMessage) -> Self {
        Self {
            id: message.id,
            pattern: message.pattern,
            trace: message.trace,
            delegate: message.delegate.map(Arc::new),
        }
    }

    pub fn delegate(&self) -> Option<&Value> {
        self.delegate.as_deref()
    }

    /// Wire form of an outbound call
    pub fn to_request(&self) -> RequestMessage {
        RequestMessage {
            id: self.id.clone(),
            pattern: self.pattern.clone(),
            delegate: self.delegate().cloned(),
            trace: self.trace.clone(),
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern(value: Value) -> Pattern {
        Pattern::from_value(value).unwrap()
    }

    #[test]
    fn test_delegate_is_taken_from_pattern() {
        let ctx = CallContext::outbound(
            pattern(json!({"topic": "math", "cmd": "add", "delegate$": {"name": "test"}})),
            None,
        );
        assert_eq!(ctx.delegate(), Some(&json!({"name": "test"})));
        assert!(ctx.pattern.delegate().is_none());
    }

    #[test]
    fn test_nested_call_does_not_inherit_delegate() {
        let outer = CallContext::outbound(
            pattern(json!({"topic": "math", "cmd": "add", "delegate$": {"name": "test"}})),
            None,
        );
        let inbound = CallContext::inbound(outer.to_request());
        assert_eq!(inbound.delegate(), Some(&json!({"name": "test"})));

        let sub = pattern(json!({"topic": "math", "cmd": "sub"}));
        let nested = CallContext::outbound(sub, Some(&inbound));
        assert!(nested.delegate().is_none());
    }

    #[test]
    fn test_nested_call_continues_trace() {
        let outer = CallContext::outbound(pattern(json!({"topic": "math"})), None);
        let inbound = CallContext::inbound(outer.to_request());
        let nested = CallContext::outbound(pattern(json!({"topic": "math"})), Some(&inbound));

        assert_eq!(nested.trace.trace_id, outer.trace.trace_id);
        assert_eq!(nested.trace.parent_span_id.as_deref(), Some(outer.trace.span_id.as_str()));
        assert_ne!(nested.id, outer.id);
    }
}
