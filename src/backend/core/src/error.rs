//! Error handling for Permstack Core.
//!
//! This module provides:
//! - A single coded error type with context and chaining
//! - Stable error codes so callers (command layers, admin tooling) can branch
//!   on an explicit outcome instead of parsing messages
//! - Severity-aware logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use permstack_core::error::{ErrorCode, PermsError, Result};
//!
//! match track.append_group(&group) {
//!     Ok(()) => {}
//!     Err(e) if e.code() == ErrorCode::ObjectAlreadyHas => { /* tell the operator */ }
//!     Err(e) => return Err(e),
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Permstack operations.
pub type Result<T> = std::result::Result<T, PermsError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Node Errors (1000-1099)
    MalformedNode,

    // Membership Errors (1100-1199)
    ObjectAlreadyHas,
    ObjectLacks,
    IndexOutOfBounds,
    InvalidName,

    // Reference Errors (1200-1299)
    InconsistentReference,
    NotFound,

    // Storage Errors (2000-2099)
    StorageUnavailable,
    StorageTimeout,
    DatabaseError,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::MalformedNode => 1000,

            Self::ObjectAlreadyHas => 1100,
            Self::ObjectLacks => 1101,
            Self::IndexOutOfBounds => 1102,
            Self::InvalidName => 1103,

            Self::InconsistentReference => 1200,
            Self::NotFound => 1201,

            Self::StorageUnavailable => 2000,
            Self::StorageTimeout => 2001,
            Self::DatabaseError => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    ///
    /// The core never retries on its own; this is a hint for the caller.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable | Self::StorageTimeout | Self::DatabaseError
        )
    }

    /// Whether this error describes an expected, user-correctable condition.
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedNode
                | Self::ObjectAlreadyHas
                | Self::ObjectLacks
                | Self::IndexOutOfBounds
                | Self::InvalidName
                | Self::NotFound
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "node",
            1100..=1199 => "membership",
            1200..=1299 => "reference",
            2000..=2099 => "storage",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// User errors (bad input, duplicate membership)
    Low,
    /// Operational inconsistencies that an operator should look at
    Medium,
    /// Storage and serialization failures
    High,
    /// Bugs and unusable configuration
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::MalformedNode
            | ErrorCode::ObjectAlreadyHas
            | ErrorCode::ObjectLacks
            | ErrorCode::IndexOutOfBounds
            | ErrorCode::InvalidName
            | ErrorCode::NotFound => Self::Low,

            ErrorCode::InconsistentReference | ErrorCode::StorageTimeout => Self::Medium,

            ErrorCode::StorageUnavailable
            | ErrorCode::DatabaseError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError => Self::High,

            ErrorCode::ConfigurationError | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity identifier (user uuid, group name, track name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Permstack Core.
#[derive(Error, Debug)]
pub struct PermsError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Message safe to show to an operator
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for PermsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl PermsError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    /// Create an error with both a public and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the structured details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.details = self.details.with_context(key, value);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity and count it.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    error_message = %self.message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "Permstack error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    error_message = %self.message,
                    details = ?self.details,
                    "Permstack warning"
                );
            }
            ErrorSeverity::Low => {
                debug!(
                    error_code = %code,
                    category = category,
                    error_message = %self.message,
                    "User-correctable error"
                );
            }
        }

        counter!("permstack_errors_total", "category" => category, "code" => code).increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl PermsError {
    /// A serialized node string that cannot be parsed.
    pub fn malformed_node(input: impl Into<String>, reason: impl Into<String>) -> Self {
        let input = input.into();
        let reason = reason.into();
        Self::new(
            ErrorCode::MalformedNode,
            format!("Malformed node '{}': {}", input, reason),
        )
        .with_context("input", &input)
        .with_context("reason", &reason)
    }

    /// The target already has the given object (node, track member).
    pub fn already_has(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let object = object.into();
        Self::new(
            ErrorCode::ObjectAlreadyHas,
            format!("{} '{}' already has {}", entity_type, entity_id, object),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity(entity_type, entity_id)
                .with_context("object", object),
        )
    }

    /// The target lacks the given object (node, track member).
    pub fn lacks(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let object = object.into();
        Self::new(
            ErrorCode::ObjectLacks,
            format!("{} '{}' does not have {}", entity_type, entity_id, object),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity(entity_type, entity_id)
                .with_context("object", object),
        )
    }

    /// An insert position past the end of an ordered collection.
    pub fn index_out_of_bounds(entity_id: impl Into<String>, index: usize, size: usize) -> Self {
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::IndexOutOfBounds,
            format!("Position {} is out of bounds for '{}' (size {})", index, entity_id, size),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("track", entity_id)
                .with_context("index", index)
                .with_context("size", size),
        )
    }

    /// A name that is not allowed for a group or track.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::InvalidName, format!("Invalid name: '{}'", name))
            .with_context("name", name)
    }

    /// A referenced entity that does not exist.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(entity_type, entity_id))
    }

    /// A holder or track refers to something that no longer exists.
    pub fn inconsistent_reference(
        referrer_type: impl Into<String>,
        referrer_id: impl Into<String>,
        missing: impl Into<String>,
    ) -> Self {
        let referrer_type = referrer_type.into();
        let referrer_id = referrer_id.into();
        let missing = missing.into();
        Self::new(
            ErrorCode::InconsistentReference,
            format!(
                "{} '{}' references missing group '{}'",
                referrer_type, referrer_id, missing
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity(referrer_type, referrer_id)
                .with_context("missing", missing),
        )
    }

    /// A backing could not service a request.
    pub fn storage_unavailable(backing: impl Into<String>, reason: impl Into<String>) -> Self {
        let backing = backing.into();
        Self::with_internal(
            ErrorCode::StorageUnavailable,
            format!("Storage backing '{}' is unavailable", backing),
            reason,
        )
        .with_context("backing", backing)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| PermsError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| PermsError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| PermsError::new(ErrorCode::NotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| PermsError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for PermsError {
    fn from(error: sqlx::Error) -> Self {
        let (code, msg) = match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::StorageUnavailable,
                "Unable to connect to the database",
            ),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
                ErrorCode::DeserializationError,
                "Stored data could not be decoded",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for PermsError {
    fn from(error: redis::RedisError) -> Self {
        let code = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_timeout()
        {
            ErrorCode::StorageUnavailable
        } else {
            ErrorCode::DatabaseError
        };

        Self::with_internal(code, "A redis error occurred", error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for PermsError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<serde_yaml::Error> for PermsError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::with_internal(
            ErrorCode::DeserializationError,
            "Failed to process YAML data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for PermsError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::StorageTimeout,
            "Storage operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::task::JoinError> for PermsError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "Background task failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for PermsError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::NotFound,
            std::io::ErrorKind::InvalidData => ErrorCode::DeserializationError,
            _ => ErrorCode::StorageUnavailable,
        };

        Self::with_internal(code, "An I/O error occurred", error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for PermsError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration could not be loaded",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
