//! # Error Handling
//!
//! Error types shared across the EchoDB crates.
//!
//! Policy in one line: object-store absence is data (`Ok(None)`), everything
//! else is one of the variants below. Background workers log and continue;
//! foreground operations bubble the error to the caller.

use thiserror::Error;

/// Result type alias for EchoDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for EchoDB
#[derive(Error, Debug)]
pub enum Error {
    /// A mutation was attempted on a node that does not hold the lease.
    #[error("not the leader")]
    NotLeader,

    /// The component has been closed; the operation fails fast.
    #[error("{component} is closed")]
    Closed { component: &'static str },

    /// The object store rejected or failed an operation.
    #[error("object store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// On-store bytes that cannot be decoded (bad length prefix, short blob,
    /// index offset past end of data).
    #[error("corrupt data in {location}: {message}")]
    Corrupt { location: String, message: String },

    /// Programmer-error conditions. Panics in debug builds via
    /// [`Error::internal`], fails the operation in release.
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Construct an [`Error::Internal`], panicking in debug builds so the
    /// offending call site surfaces during development.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        debug_assert!(false, "internal error: {}", message);
        Error::Internal { message }
    }

    pub fn corrupt(location: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Corrupt {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn store_unavailable(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::StoreUnavailable {
            message: message.into(),
            source,
        }
    }

    /// Check if the error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::StoreUnavailable { .. } => true,
            Error::NotLeader => true,
            Error::Closed { .. } => false,
            Error::Corrupt { .. } => false,
            Error::Internal { .. } => false,
            Error::Configuration { .. } => false,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NotLeader => "NOT_LEADER",
            Error::Closed { .. } => "CLOSED",
            Error::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Error::Corrupt { .. } => "CORRUPT",
            Error::Internal { .. } => "INTERNAL_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
        }
    }
}
