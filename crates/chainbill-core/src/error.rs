use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::StorageError;

/// Domain error codes shared across the engine.
///
/// These are the values persisted in `orders.failure_reason` and surfaced in
/// webhook `error.code` fields, so the textual form is part of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Client validation
    InvalidRequest,
    InvalidFormat,

    // Auth/ownership
    InvalidApiKey,
    Forbidden,
    NotFound,
    PermissionNotFound,

    // State conflicts
    SubscriptionExists,
    AccountExists,
    SubscriptionNotActive,

    // Payment - retryable
    InsufficientBalance,
    InsufficientSpendingAllowance,

    // Payment - terminal
    PermissionRevoked,
    PermissionExpired,

    // Payment - opaque
    PaymentFailed,
    GenericPermissionError,
    UnknownPaymentError,

    // Bundler
    UserOperationFailed,

    // Upstream infrastructure
    UpstreamServiceError,

    // Internal
    InternalError,
}

impl ErrorCode {
    /// Textual form stored in the database and sent to merchants.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionNotFound => "PERMISSION_NOT_FOUND",
            ErrorCode::SubscriptionExists => "SUBSCRIPTION_EXISTS",
            ErrorCode::AccountExists => "ACCOUNT_EXISTS",
            ErrorCode::SubscriptionNotActive => "SUBSCRIPTION_NOT_ACTIVE",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::InsufficientSpendingAllowance => "INSUFFICIENT_SPENDING_ALLOWANCE",
            ErrorCode::PermissionRevoked => "PERMISSION_REVOKED",
            ErrorCode::PermissionExpired => "PERMISSION_EXPIRED",
            ErrorCode::PaymentFailed => "PAYMENT_FAILED",
            ErrorCode::GenericPermissionError => "GENERIC_PERMISSION_ERROR",
            ErrorCode::UnknownPaymentError => "UNKNOWN_PAYMENT_ERROR",
            ErrorCode::UserOperationFailed => "USER_OPERATION_FAILED",
            ErrorCode::UpstreamServiceError => "UPSTREAM_SERVICE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Parse a code previously stored via [`ErrorCode::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        let code = match s {
            "INVALID_REQUEST" => ErrorCode::InvalidRequest,
            "INVALID_FORMAT" => ErrorCode::InvalidFormat,
            "INVALID_API_KEY" => ErrorCode::InvalidApiKey,
            "FORBIDDEN" => ErrorCode::Forbidden,
            "NOT_FOUND" => ErrorCode::NotFound,
            "PERMISSION_NOT_FOUND" => ErrorCode::PermissionNotFound,
            "SUBSCRIPTION_EXISTS" => ErrorCode::SubscriptionExists,
            "ACCOUNT_EXISTS" => ErrorCode::AccountExists,
            "SUBSCRIPTION_NOT_ACTIVE" => ErrorCode::SubscriptionNotActive,
            "INSUFFICIENT_BALANCE" => ErrorCode::InsufficientBalance,
            "INSUFFICIENT_SPENDING_ALLOWANCE" => ErrorCode::InsufficientSpendingAllowance,
            "PERMISSION_REVOKED" => ErrorCode::PermissionRevoked,
            "PERMISSION_EXPIRED" => ErrorCode::PermissionExpired,
            "PAYMENT_FAILED" => ErrorCode::PaymentFailed,
            "GENERIC_PERMISSION_ERROR" => ErrorCode::GenericPermissionError,
            "UNKNOWN_PAYMENT_ERROR" => ErrorCode::UnknownPaymentError,
            "USER_OPERATION_FAILED" => ErrorCode::UserOperationFailed,
            "UPSTREAM_SERVICE_ERROR" => ErrorCode::UpstreamServiceError,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            _ => return None,
        };
        Some(code)
    }

    /// HTTP status class for the code.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidRequest | ErrorCode::InvalidFormat => 400,
            ErrorCode::InvalidApiKey => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound | ErrorCode::PermissionNotFound => 404,
            ErrorCode::SubscriptionExists | ErrorCode::AccountExists => 409,
            ErrorCode::SubscriptionNotActive => 400,
            ErrorCode::InsufficientBalance
            | ErrorCode::InsufficientSpendingAllowance
            | ErrorCode::PermissionRevoked
            | ErrorCode::PermissionExpired
            | ErrorCode::PaymentFailed
            | ErrorCode::GenericPermissionError
            | ErrorCode::UnknownPaymentError => 402,
            ErrorCode::UserOperationFailed => 409,
            ErrorCode::UpstreamServiceError => 503,
            ErrorCode::InternalError => 500,
        }
    }

    /// Whether the code may be surfaced verbatim to merchants.
    ///
    /// Only payment-class (402) codes are exposable; everything else is
    /// replaced with a generic internal error before webhook delivery.
    pub fn is_exposable(&self) -> bool {
        self.http_status() == 402
    }

    /// Payment failures the dunning schedule retries.
    pub fn is_retryable_payment(&self) -> bool {
        matches!(
            self,
            ErrorCode::InsufficientBalance | ErrorCode::InsufficientSpendingAllowance
        )
    }

    /// Payment failures that end the subscription immediately.
    pub fn is_terminal_payment(&self) -> bool {
        matches!(self, ErrorCode::PermissionRevoked | ErrorCode::PermissionExpired)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed HTTP-mappable error raised by the core.
///
/// The API layer maps `status` straight to a response; webhooks sanitise the
/// code/message via [`ErrorCode::is_exposable`] before delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpError {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl HttpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.http_status(),
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

/// Main error type for chainbill
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Storage errors (store operations)
    Storage(StorageError),

    /// Typed domain errors carrying an HTTP status and error code
    Http(HttpError),

    /// Queue/timer transport errors
    Queue(String),

    /// HTTP/network errors (provider API, webhook targets)
    Network(String),

    /// Serialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Http(e) => write!(f, "{}", e),
            Error::Queue(msg) => write!(f, "Queue error: {}", msg),
            Error::Network(msg) => write!(f, "Network error: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for Error {
    fn from(error: StorageError) -> Self {
        Error::Storage(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Network(error.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(error: redis::RedisError) -> Self {
        Error::Queue(error.to_string())
    }
}

// Common error constructors
impl Error {
    /// Create a typed domain error; status derived from the code.
    pub fn http(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Http(HttpError::new(code, message))
    }

    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new queue error
    pub fn queue<T: Into<String>>(msg: T) -> Self {
        Error::Queue(msg.into())
    }

    /// Create a new network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        Error::Network(msg.into())
    }

    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Http(e) => e.status,
            Error::Storage(StorageError::NotFound(_)) => 404,
            Error::Storage(StorageError::Conflict(_)) => 409,
            Error::Network(_) | Error::Queue(_) => 503,
            _ => 500,
        }
    }

    /// Domain error code carried by this error, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Http(e) => Some(e.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [
            ErrorCode::InsufficientBalance,
            ErrorCode::PermissionRevoked,
            ErrorCode::UpstreamServiceError,
            ErrorCode::SubscriptionNotActive,
            ErrorCode::UserOperationFailed,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("NOT_A_CODE"), None);
    }

    #[test]
    fn test_exposable_is_payment_class() {
        assert!(ErrorCode::InsufficientBalance.is_exposable());
        assert!(ErrorCode::PaymentFailed.is_exposable());
        assert!(!ErrorCode::InternalError.is_exposable());
        assert!(!ErrorCode::UpstreamServiceError.is_exposable());
        assert!(!ErrorCode::UserOperationFailed.is_exposable());
    }

    #[test]
    fn test_http_error_status() {
        let err = Error::http(ErrorCode::SubscriptionExists, "already registered");
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.error_code(), Some(ErrorCode::SubscriptionExists));
    }
}
