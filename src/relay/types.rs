use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::Trace;
use super::errors::BusinessError;
use crate::types::Pattern;

/// Response envelope: exactly one of payload or error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Payload(Value),
    Error(BusinessError),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Reply::Payload(value) => Some(value),
            Reply::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&BusinessError> {
        match self {
            Reply::Error(err) => Some(err),
            Reply::Payload(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Value, BusinessError> {
        match self {
            Reply::Payload(value) => Ok(value),
            Reply::Error(err) => Err(err),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Payload(value)
    }
}

impl From<BusinessError> for Reply {
    fn from(err: BusinessError) -> Self {
        Reply::Error(err)
    }
}

impl From<Result<Value, BusinessError>> for Reply {
    fn from(result: Result<Value, BusinessError>) -> Self {
        match result {
            Ok(value) => Reply::Payload(value),
            Err(err) => Reply::Error(err),
        }
    }
}

/// Outbound call as it travels to the responder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Correlation id
    pub id: String,
    /// Full pattern minus `delegate$`
    pub pattern: Pattern,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Value>,
    pub trace: Trace,
}

/// One reply on the caller's inbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Correlation id of the call being answered
    pub id: String,
    pub trace: Trace,
    pub reply: Reply,
}
