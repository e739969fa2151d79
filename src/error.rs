//! Unified error handling for cmdforge
//!
//! This module provides a centralized error type that consolidates all
//! domain-specific errors throughout the codebase. It implements error
//! categorization for:
//! - User errors (recoverable, actionable by users)
//! - Resource errors (device memory exhaustion, temporary conditions)
//! - Internal errors (bugs, system failures)

use std::fmt;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for cmdforge
///
/// This enum consolidates all domain-specific errors into a single type
/// that can be used throughout the codebase. It supports categorization
/// via the `category()` method.
#[derive(Debug, thiserror::Error)]
pub enum CmdForgeError {
    // ========== Resource Errors ==========
    /// Device memory allocation failed
    #[error("out of device memory: {0}")]
    OutOfDeviceMemory(String),

    // ========== Lifecycle Errors ==========
    /// Operation requires an initialized container
    #[error("command container not initialized")]
    NotInitialized,

    /// Operation requires a command stream receiver
    #[error("no command stream receiver attached: {0}")]
    NoCommandStreamReceiver(String),

    // ========== Configuration Errors ==========
    /// Invalid debug-flag or container configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== I/O Errors ==========
    /// File I/O error (configuration files)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    InternalError(String),
}

impl CmdForgeError {
    /// Categorize the error for handling decisions
    ///
    /// Returns the error category, which can be used to determine
    /// whether an error is recoverable, user-facing, or internal.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CmdForgeError::OutOfDeviceMemory(_) => ErrorCategory::Resource,

            CmdForgeError::NotInitialized | CmdForgeError::NoCommandStreamReceiver(_) => {
                ErrorCategory::Lifecycle
            }

            CmdForgeError::InvalidConfiguration(_) | CmdForgeError::IoError(_) => {
                ErrorCategory::User
            }

            CmdForgeError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Resource exhaustion is recoverable once in-flight work retires and
    /// allocations return to their reuse pools.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Resource)
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// Categories help determine how to handle errors:
/// - User: Show to user, ask them to fix input
/// - Resource: Retry after in-flight work completes
/// - Lifecycle: Caller invoked an operation out of order
/// - Internal: Log and report as bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input or configuration
    User,
    /// Resource error - device memory or pool exhaustion
    Resource,
    /// Lifecycle error - operation invoked out of order
    Lifecycle,
    /// Internal error - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Lifecycle => write!(f, "Lifecycle"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Helper type alias for Results using CmdForgeError
pub type CmdResult<T> = std::result::Result<T, CmdForgeError>;

/// Create an out-of-device-memory error with context
///
/// # Examples
/// ```ignore
/// return Err(oom_error!("command buffer of {} bytes", size));
/// ```
#[macro_export]
macro_rules! oom_error {
    ($msg:expr) => {
        $crate::error::CmdForgeError::OutOfDeviceMemory($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CmdForgeError::OutOfDeviceMemory(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("unexpected heap state"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::CmdForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::CmdForgeError::InternalError(format!($fmt, $($arg)*))
    };
}
