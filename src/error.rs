//! Error types for the aggregator

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Request construction failed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Remote query service returned an error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// One entry of a remote error's `errors` list
///
/// Mirrors the GraphQL-style error objects returned by the record service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteErrorDetail {
    /// Backend error type, e.g. `DynamoDB:DynamoDbException`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Human readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error returned by a remote query adapter
///
/// Both fields are optional because the remote service is inconsistent about
/// where it puts the failure description.
#[derive(Error, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", self.describe())]
pub struct RemoteError {
    /// Top-level message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Per-resolver errors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RemoteErrorDetail>,
}

impl RemoteError {
    /// Create an error carrying only a top-level message
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            errors: Vec::new(),
        }
    }

    /// Create an error carrying a single typed detail entry
    pub fn typed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: None,
            errors: vec![RemoteErrorDetail {
                error_type: Some(error_type.into()),
                message: Some(message.into()),
            }],
        }
    }

    fn describe(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| match (&e.error_type, &e.message) {
                (Some(t), Some(m)) => format!("{}: {}", t, m),
                (Some(t), None) => t.clone(),
                (None, Some(m)) => m.clone(),
                (None, None) => "unknown".to_string(),
            })
            .collect();
        if parts.is_empty() {
            "unknown remote error".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Validation errors
///
/// Error type for configuration and input validation
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field name being validated
        field: String,
        /// Description of the format error
        message: String,
    },
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_prefers_message() {
        let err = RemoteError::message("Not Authorized to access listScoreResults");
        assert_eq!(err.to_string(), "Not Authorized to access listScoreResults");
    }

    #[test]
    fn test_remote_error_display_joins_details() {
        let err = RemoteError {
            message: None,
            errors: vec![
                RemoteErrorDetail {
                    error_type: Some("Unauthorized".to_string()),
                    message: Some("denied".to_string()),
                },
                RemoteErrorDetail {
                    error_type: None,
                    message: Some("second".to_string()),
                },
            ],
        };
        assert_eq!(err.to_string(), "Unauthorized: denied; second");
        assert_eq!(RemoteError::default().to_string(), "unknown remote error");
    }

    #[test]
    fn test_remote_error_serializes_camel_case() {
        let err = RemoteError::typed("DynamoDB:DynamoDbException", "slow down");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"errorType\":\"DynamoDB:DynamoDbException\""));
        assert!(!json.contains("\"message\":null"));
    }
}
