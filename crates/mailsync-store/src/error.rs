//! Error types shared by every storage and transport backend.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by remote stores, transports, pushers and local stores.
///
/// Payloads are plain strings so errors can be cloned, recorded and replayed
/// into events without borrowing the backend that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The local storage medium is not mounted or otherwise unreachable.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Authentication was rejected by the server.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server certificate could not be validated.
    #[error("Certificate validation failed for {host}: {message}")]
    Certificate {
        /// Host whose certificate was rejected.
        host: String,
        /// Validation failure detail.
        message: String,
    },

    /// The referenced message does not exist on the server.
    #[error("Message does not exist: {0}")]
    MessageNotFound(String),

    /// The referenced folder does not exist.
    #[error("Folder does not exist: {0}")]
    FolderNotFound(String),

    /// The folder could not be opened for writing.
    #[error("Folder is read-only: {0}")]
    ReadOnly(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Network connection failed or dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server rejected a command.
    #[error("Server rejected command: {message}")]
    Rejected {
        /// Server supplied text.
        message: String,
        /// Whether retrying can never succeed.
        permanent: bool,
    },

    /// The backend does not implement the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Returns true if retrying the same operation can never succeed.
    ///
    /// This is the default classification used during pending-command replay.
    /// Backends with different semantics override
    /// [`Store::is_permanent_failure`](crate::Store::is_permanent_failure).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::Auth(_)
            | Self::MessageNotFound(_)
            | Self::FolderNotFound(_)
            | Self::ReadOnly(_) => true,
            Self::Rejected { permanent, .. } => *permanent,
            Self::StorageUnavailable(_)
            | Self::Certificate { .. }
            | Self::Timeout(_)
            | Self::Connection(_)
            | Self::Unsupported(_)
            | Self::Io(_) => false,
        }
    }

    /// Returns true if the local storage medium is unavailable.
    #[must_use]
    pub const fn is_storage_unavailable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Returns true for certificate validation failures.
    #[must_use]
    pub const fn is_certificate(&self) -> bool {
        matches!(self, Self::Certificate { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(Error::Auth("bad password".into()).is_permanent());
        assert!(Error::MessageNotFound("42".into()).is_permanent());
        assert!(Error::FolderNotFound("Archive".into()).is_permanent());
        assert!(Error::ReadOnly("INBOX".into()).is_permanent());
        assert!(
            Error::Rejected {
                message: "quota".into(),
                permanent: true
            }
            .is_permanent()
        );

        assert!(!Error::Timeout(Duration::from_secs(30)).is_permanent());
        assert!(!Error::Connection("reset".into()).is_permanent());
        assert!(
            !Error::Rejected {
                message: "try later".into(),
                permanent: false
            }
            .is_permanent()
        );
        assert!(!Error::StorageUnavailable("sdcard".into()).is_permanent());
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::other("disk full").into();
        assert_eq!(err, Error::Io("disk full".into()));
    }
}
