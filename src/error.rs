/*!
 * @file error.rs
 * @brief DoppelDB error handling
 */

use bson::{doc, Document};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DoppelError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("Wire protocol error: {0}")]
    WireProtocol(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

pub type Result<T> = std::result::Result<T, DoppelError>;

/// A command-level failure carrying the canonical MongoDB error code.
///
/// These are shaped into `{ok: 0.0, errmsg, code, codeName}` by the
/// dispatcher and never terminate the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub code: i32,
    pub message: String,
}

pub type CommandResult = std::result::Result<Document, CommandError>;

impl CommandError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(code::INTERNAL_ERROR, message)
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(code::BAD_VALUE, message)
    }

    pub fn failed_to_parse(message: impl Into<String>) -> Self {
        Self::new(code::FAILED_TO_PARSE, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(code::TYPE_MISMATCH, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(code::UNAUTHORIZED, message)
    }

    pub fn authentication_failed() -> Self {
        // One message for every failure mode so the step that failed is
        // not revealed to the client.
        Self::new(code::AUTHENTICATION_FAILED, "Authentication failed.")
    }

    pub fn cursor_not_found(id: i64) -> Self {
        Self::new(code::CURSOR_NOT_FOUND, format!("cursor id {} not found", id))
    }

    pub fn cursor_in_use(id: i64) -> Self {
        Self::new(
            code::CURSOR_IN_USE,
            format!("cursor id {} is already in use", id),
        )
    }

    pub fn namespace_not_found(message: impl Into<String>) -> Self {
        Self::new(code::NAMESPACE_NOT_FOUND, message)
    }

    pub fn namespace_exists(ns: &str) -> Self {
        Self::new(
            code::NAMESPACE_EXISTS,
            format!("Collection {} already exists.", ns),
        )
    }

    pub fn invalid_namespace(message: impl Into<String>) -> Self {
        Self::new(code::INVALID_NAMESPACE, message)
    }

    pub fn command_not_found(name: &str) -> Self {
        Self::new(
            code::COMMAND_NOT_FOUND,
            format!("no such command: '{}'", name),
        )
    }

    pub fn duplicate_key(ns: &str, key: &str) -> Self {
        Self::new(
            code::DUPLICATE_KEY,
            format!(
                "E11000 duplicate key error collection: {} index: _id_ dup key: {}",
                ns, key
            ),
        )
    }

    pub fn max_time_expired() -> Self {
        Self::new(code::MAX_TIME_MS_EXPIRED, "operation exceeded time limit")
    }

    pub fn query_plan_killed(message: impl Into<String>) -> Self {
        Self::new(code::QUERY_PLAN_KILLED, message)
    }

    /// Error identified only by its `Location<code>` name.
    pub fn location(code: i32, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    /// The required-field error every command argument parser shares.
    pub fn missing_field(command: &str, field: &str) -> Self {
        Self::location(
            40414,
            format!(
                "BSON field '{}.{}' is missing but a required field",
                command, field
            ),
        )
    }

    pub fn code_name(&self) -> String {
        match known_code_name(self.code) {
            Some(name) => name.to_string(),
            None => format!("Location{}", self.code),
        }
    }

    pub fn to_document(&self) -> Document {
        doc! {
            "ok": 0.0,
            "errmsg": self.message.clone(),
            "code": self.code,
            "codeName": self.code_name(),
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code_name(), self.code, self.message)
    }
}

impl std::error::Error for CommandError {}

/// Canonical MongoDB error codes used throughout the command surface.
pub mod code {
    pub const INTERNAL_ERROR: i32 = 1;
    pub const BAD_VALUE: i32 = 2;
    pub const FAILED_TO_PARSE: i32 = 9;
    pub const UNAUTHORIZED: i32 = 13;
    pub const TYPE_MISMATCH: i32 = 14;
    pub const AUTHENTICATION_FAILED: i32 = 18;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const INDEX_NOT_FOUND: i32 = 27;
    pub const CURSOR_NOT_FOUND: i32 = 43;
    pub const CURSOR_IN_USE: i32 = 46;
    pub const NAMESPACE_EXISTS: i32 = 48;
    pub const MAX_TIME_MS_EXPIRED: i32 = 50;
    pub const DOLLAR_PREFIXED_FIELD_NAME: i32 = 52;
    pub const COMMAND_NOT_FOUND: i32 = 59;
    pub const IMMUTABLE_FIELD: i32 = 66;
    pub const INVALID_OPTIONS: i32 = 72;
    pub const INVALID_NAMESPACE: i32 = 73;
    pub const WRITE_CONFLICT: i32 = 112;
    pub const INVALID_PIPELINE_OPERATOR: i32 = 168;
    pub const QUERY_PLAN_KILLED: i32 = 175;
    pub const DUPLICATE_KEY: i32 = 11000;
}

fn known_code_name(c: i32) -> Option<&'static str> {
    Some(match c {
        code::INTERNAL_ERROR => "InternalError",
        code::BAD_VALUE => "BadValue",
        code::FAILED_TO_PARSE => "FailedToParse",
        code::UNAUTHORIZED => "Unauthorized",
        code::TYPE_MISMATCH => "TypeMismatch",
        code::AUTHENTICATION_FAILED => "AuthenticationFailed",
        code::NAMESPACE_NOT_FOUND => "NamespaceNotFound",
        code::INDEX_NOT_FOUND => "IndexNotFound",
        code::CURSOR_NOT_FOUND => "CursorNotFound",
        code::CURSOR_IN_USE => "CursorInUse",
        code::NAMESPACE_EXISTS => "NamespaceExists",
        code::MAX_TIME_MS_EXPIRED => "MaxTimeMSExpired",
        code::DOLLAR_PREFIXED_FIELD_NAME => "DollarPrefixedFieldName",
        code::COMMAND_NOT_FOUND => "CommandNotFound",
        code::IMMUTABLE_FIELD => "ImmutableField",
        code::INVALID_OPTIONS => "InvalidOptions",
        code::INVALID_NAMESPACE => "InvalidNamespace",
        code::WRITE_CONFLICT => "WriteConflict",
        code::INVALID_PIPELINE_OPERATOR => "InvalidPipelineOperator",
        code::QUERY_PLAN_KILLED => "QueryPlanKilled",
        code::DUPLICATE_KEY => "DuplicateKey",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_document_shape() {
        let err = CommandError::bad_value("bad");
        let doc = err.to_document();
        assert_eq!(doc.get_f64("ok").unwrap(), 0.0);
        assert_eq!(doc.get_str("errmsg").unwrap(), "bad");
        assert_eq!(doc.get_i32("code").unwrap(), 2);
        assert_eq!(doc.get_str("codeName").unwrap(), "BadValue");
    }

    #[test]
    fn location_code_name() {
        let err = CommandError::location(40414, "missing");
        assert_eq!(err.code_name(), "Location40414");
    }
}
