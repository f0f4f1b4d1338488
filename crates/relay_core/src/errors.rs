use serde::{Deserialize, Serialize};
use std::fmt;

/// Main result type for Relay engine operations
pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ErrorCode {
    // General Errors
    Unknown,
    NotSupported,
    InternalError,
    ConfigError,

    // Selection Errors
    NoCandidate,
    AmbiguousSelection,

    // Resolution Errors
    ToolNotFound,
    CatalogUnavailable,

    // Validation Errors
    ParameterValidation,

    // Credential Errors
    CredentialNotFound,
    DecryptionFailed,

    // Connection Errors
    ConnectionTimeout,
    ConnectionRefused,
    HandshakeFailure,
    PoolExhausted,

    // Execution Errors
    ExecutionTimeout,
    TransportFailure,
    ExecutionCancelled,
    /// The remote tool ran but reported failure. Never surfaced as a
    /// pipeline error; carried inside a success=false ExecutionResult.
    SemanticFailure,

    // Audit Errors
    AuditSinkError,

    // Serialization Errors
    SerializationError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ErrorCategory {
    System,
    Configuration,
    Selection,
    Resolution,
    Validation,
    Credential,
    Connection,
    Execution,
    Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
pub struct RelayError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    /// Per-item context, e.g. one entry per violated parameter field.
    pub details: Vec<String>,
}

impl RelayError {
    pub fn new(
        code: ErrorCode,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: &str,
    ) -> Self {
        Self {
            code,
            category,
            severity,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ConnectionTimeout | ErrorCode::ExecutionTimeout
        )
    }

    /// Connection establishment is the one stage allowed to retry; no
    /// other code is transient.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrorCode::ConnectionRefused)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "[{:?}/{:?}] {}", self.category, self.code, self.message)
        } else {
            write!(
                f,
                "[{:?}/{:?}] {}: {}",
                self.category,
                self.code,
                self.message,
                self.details.join("; ")
            )
        }
    }
}

impl std::error::Error for RelayError {}

// Conversion from serde_json::Error
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::new(
            ErrorCode::SerializationError,
            ErrorCategory::System,
            ErrorSeverity::Medium,
            &format!("JSON serialization error: {}", err),
        )
    }
}

// Credential errors are narrowed before they reach any caller: the
// NotFound/DecryptionFailed split survives, the reason for a decryption
// failure does not.
impl From<cred_vault::VaultError> for RelayError {
    fn from(err: cred_vault::VaultError) -> Self {
        match err {
            cred_vault::VaultError::NotFound => RelayError::new(
                ErrorCode::CredentialNotFound,
                ErrorCategory::Credential,
                ErrorSeverity::Medium,
                "no credential for target",
            ),
            cred_vault::VaultError::DecryptionFailed
            | cred_vault::VaultError::Released
            | cred_vault::VaultError::Store(_) => RelayError::new(
                ErrorCode::DecryptionFailed,
                ErrorCategory::Credential,
                ErrorSeverity::High,
                "credential decryption failed",
            ),
        }
    }
}
