use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Authorization failed: {status} - {message}")]
    Authorization { status: u16, message: String },

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Unexpected response: {status:?} - {message}")]
    Unexpected { status: Option<u16>, message: String },

    #[error("Invalid sync transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("JSON parsing failed: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// 呼び出し結果の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Validation,
    Authorization,
    Server,
    Connectivity,
    Configuration,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "VALIDATION",
            FailureKind::Authorization => "AUTHORIZATION",
            FailureKind::Server => "SERVER",
            FailureKind::Connectivity => "CONNECTIVITY",
            FailureKind::Configuration => "CONFIGURATION",
            FailureKind::Unknown => "UNKNOWN",
        }
    }
}

impl Error {
    /// バッチ層・同期層で再試行してよいエラーか
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Server { .. } | Error::Connectivity(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Validation(_) | Error::InvalidTransition { .. } => FailureKind::Validation,
            Error::Authorization { .. } => FailureKind::Authorization,
            Error::Server { .. } => FailureKind::Server,
            Error::Connectivity(_) => FailureKind::Connectivity,
            Error::Configuration(_) | Error::ConfigurationMissing(_) => FailureKind::Configuration,
            _ => FailureKind::Unknown,
        }
    }

    /// HTTPステータスコードからエラーを分類（404は呼び出し側で扱う）
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Error::Authorization { status, message },
            500..=599 => Error::Server { status, message },
            _ => Error::Unexpected {
                status: Some(status),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Error::Connectivity(err.to_string());
        }
        if let Some(status) = err.status() {
            return Error::from_status(status.as_u16(), err.to_string());
        }
        Error::Unexpected {
            status: None,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        // Given/When: 代表的なステータスコードを分類
        // Then: 認可・サーバー・その他に振り分けられる
        assert_eq!(Error::from_status(401, "x").kind(), FailureKind::Authorization);
        assert_eq!(Error::from_status(403, "x").kind(), FailureKind::Authorization);
        assert_eq!(Error::from_status(500, "x").kind(), FailureKind::Server);
        assert_eq!(Error::from_status(503, "x").kind(), FailureKind::Server);
        assert_eq!(Error::from_status(418, "x").kind(), FailureKind::Unknown);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Server { status: 502, message: "bad gateway".to_string() }.is_retryable());
        assert!(Error::Connectivity("refused".to_string()).is_retryable());
        assert!(!Error::Validation("bad key".to_string()).is_retryable());
        assert!(!Error::Authorization { status: 401, message: "no".to_string() }.is_retryable());
        assert!(!Error::Configuration("tls".to_string()).is_retryable());
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::Connectivity).unwrap();
        assert_eq!(json, "\"CONNECTIVITY\"");
        assert_eq!(FailureKind::Server.as_str(), "SERVER");
    }
}
