//! Error Classifier
//!
//! Classifies storage errors into the fault taxonomy the executor retries
//! on. SQLSTATE codes win; message patterns are the fallback when a driver
//! error carries no code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a storage error came from, independent of the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The server answered with a SQLSTATE.
    Database { code: Option<String> },
    /// Socket, TLS or protocol level failure.
    Connection,
    /// No connection became available in time.
    PoolTimedOut,
    /// The pool was closed under us.
    PoolClosed,
    /// Anything else (decode failures, driver bugs).
    Other,
}

/// Driver-neutral storage error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn database(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Database {
                code: code.map(|c| c.to_string()),
            },
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Connection,
            message: message.into(),
        }
    }

    pub fn pool_timed_out() -> Self {
        Self {
            kind: StorageErrorKind::PoolTimedOut,
            message: "timed out waiting for a pooled connection".to_string(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match &self.kind {
            StorageErrorKind::Database { code } => code.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                StorageError::database(db.code().as_deref(), db.message().to_string())
            }
            sqlx::Error::Io(e) => StorageError::connection(e.to_string()),
            sqlx::Error::Tls(e) => StorageError::connection(e.to_string()),
            sqlx::Error::Protocol(msg) => StorageError::connection(msg),
            sqlx::Error::PoolTimedOut => StorageError::pool_timed_out(),
            sqlx::Error::PoolClosed => Self {
                kind: StorageErrorKind::PoolClosed,
                message: "connection pool is closed".to_string(),
            },
            other => StorageError::other(other.to_string()),
        }
    }
}

/// Fault taxonomy used by the executor's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultClass {
    Transient,
    Timeout,
    PermissionDenied,
    PoolExhausted,
    InvalidStatement,
    Other,
}

impl FaultClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, FaultClass::Transient)
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultClass::Transient => write!(f, "Transient"),
            FaultClass::Timeout => write!(f, "Timeout"),
            FaultClass::PermissionDenied => write!(f, "PermissionDenied"),
            FaultClass::PoolExhausted => write!(f, "PoolExhausted"),
            FaultClass::InvalidStatement => write!(f, "InvalidStatement"),
            FaultClass::Other => write!(f, "Other"),
        }
    }
}

/// Fault classifier
pub struct FaultClassifier;

impl FaultClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a storage error into the taxonomy
    pub fn classify(&self, error: &StorageError) -> FaultClass {
        match &error.kind {
            StorageErrorKind::Connection | StorageErrorKind::PoolClosed => FaultClass::Transient,
            StorageErrorKind::PoolTimedOut => FaultClass::PoolExhausted,
            StorageErrorKind::Database { code: Some(code) } => Self::classify_sqlstate(code)
                .unwrap_or_else(|| Self::classify_message(&error.message)),
            StorageErrorKind::Database { code: None } | StorageErrorKind::Other => {
                Self::classify_message(&error.message)
            }
        }
    }

    fn classify_sqlstate(code: &str) -> Option<FaultClass> {
        let class = match code {
            // query_canceled, idle_in_transaction_session_timeout
            "57014" | "25P03" => FaultClass::Timeout,
            "57P01" | "57P02" | "57P03" | "53300" | "40001" | "40P01" => FaultClass::Transient,
            "42501" | "25006" => FaultClass::PermissionDenied,
            c if c.starts_with("08") => FaultClass::Transient,
            c if c.starts_with("42") || c.starts_with("22") => FaultClass::InvalidStatement,
            _ => return None,
        };
        Some(class)
    }

    fn classify_message(message: &str) -> FaultClass {
        let msg = message.to_lowercase();

        if msg.contains("statement timeout") || msg.contains("canceling statement") {
            return FaultClass::Timeout;
        }

        if msg.contains("permission denied") || msg.contains("read-only transaction") {
            return FaultClass::PermissionDenied;
        }

        if msg.contains("connection reset")
            || msg.contains("connection refused")
            || msg.contains("broken pipe")
            || msg.contains("terminating connection")
            || msg.contains("too many connections")
        {
            return FaultClass::Transient;
        }

        if msg.contains("syntax error")
            || (msg.contains("column") && msg.contains("does not exist"))
            || (msg.contains("relation") && msg.contains("does not exist"))
            || msg.contains("invalid input syntax")
        {
            return FaultClass::InvalidStatement;
        }

        FaultClass::Other
    }
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_sqlstate() {
        let classifier = FaultClassifier::new();
        let cases = [
            ("57014", FaultClass::Timeout),
            ("25P03", FaultClass::Timeout),
            ("08006", FaultClass::Transient),
            ("40001", FaultClass::Transient),
            ("53300", FaultClass::Transient),
            ("42501", FaultClass::PermissionDenied),
            ("25006", FaultClass::PermissionDenied),
            ("42703", FaultClass::InvalidStatement),
            ("22P02", FaultClass::InvalidStatement),
        ];
        for (code, expected) in cases {
            let err = StorageError::database(Some(code), "boom");
            assert_eq!(classifier.classify(&err), expected, "code {}", code);
        }
    }

    #[test]
    fn test_classify_column_not_found_message() {
        let classifier = FaultClassifier::new();
        let error = StorageError::database(None, "column \"balance\" does not exist");
        assert_eq!(classifier.classify(&error), FaultClass::InvalidStatement);
    }

    #[test]
    fn test_connection_and_pool_errors() {
        let classifier = FaultClassifier::new();
        assert_eq!(
            classifier.classify(&StorageError::connection("reset by peer")),
            FaultClass::Transient
        );
        assert_eq!(
            classifier.classify(&StorageError::pool_timed_out()),
            FaultClass::PoolExhausted
        );
        assert!(!FaultClass::PoolExhausted.is_retryable());
        assert_eq!(classifier.classify(&StorageError::other("weird")), FaultClass::Other);
    }
}
