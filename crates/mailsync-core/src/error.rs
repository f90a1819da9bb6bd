//! Error types for the controller.

use thiserror::Error;

use crate::account::AccountId;

/// Errors that can occur in controller operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A storage or transport backend failed.
    #[error("Store error: {0}")]
    Store(#[from] mailsync_store::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Account not registered with the controller.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// A folder the operation depends on is missing.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// A message is not stored locally or on the server.
    #[error("Message not found: {folder}/{uid}")]
    MessageNotFound {
        /// Folder searched.
        folder: String,
        /// Message UID.
        uid: String,
    },

    /// A message has no part with the requested id.
    #[error("Part {part_id} not found in message {uid}")]
    PartNotFound {
        /// Message UID.
        uid: String,
        /// Part identifier.
        part_id: String,
    },

    /// The account's backends cannot perform the operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A pending-command log entry could not be decoded.
    #[error("Invalid pending command {command}: {reason}")]
    InvalidPendingCommand {
        /// Command name as stored.
        command: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The controller's runtime could not be started or has stopped.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// How the worker and the pending-command replay treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Local storage is unavailable; run the same command again later.
    Retryable,
    /// Worth retrying on the next cycle, not immediately.
    Transient,
    /// Retrying can never succeed.
    Permanent,
}

impl Error {
    /// Classifies the error with the backend-independent defaults.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::Store(err) if err.is_storage_unavailable() => Disposition::Retryable,
            Self::Store(err) if err.is_permanent() => Disposition::Permanent,
            Self::Store(_) | Self::Io(_) | Self::Runtime(_) => Disposition::Transient,
            Self::Serde(_)
            | Self::AccountNotFound(_)
            | Self::FolderNotFound(_)
            | Self::MessageNotFound { .. }
            | Self::PartNotFound { .. }
            | Self::Unsupported(_)
            | Self::InvalidPendingCommand { .. }
            | Self::Config(_) => Disposition::Permanent,
        }
    }

    /// Returns the backend error, if this wraps one.
    #[must_use]
    pub const fn store_error(&self) -> Option<&mailsync_store::Error> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if local storage is unavailable.
    #[must_use]
    pub const fn is_storage_unavailable(&self) -> bool {
        matches!(self.disposition(), Disposition::Retryable)
    }

    /// Returns true for certificate validation failures.
    #[must_use]
    pub const fn is_certificate(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_certificate())
    }

    /// Message shown to the user for this error.
    ///
    /// Backend errors are unwrapped so the status line shows the root cause
    /// rather than the wrapping layer.
    #[must_use]
    pub fn root_message(&self) -> String {
        match self {
            Self::Store(err) => err.to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
