//! Error types for the replication core

use crate::backend::ResultCode;
use crate::csn::Csn;
use thiserror::Error;

/// Result type alias using the replication Error
pub type Result<T> = std::result::Result<T, Error>;

/// Replication error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from sockets and changelog files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed changelog errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// A single frame could not be decoded; the stream framing is intact
    #[error("Codec error: {0}")]
    Codec(String),

    /// Handshake refused, protocol version mismatch or unexpected message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transient connection failure, the broker reconnects
    #[error("Connection error: {0}")]
    Connection(String),

    /// A blocking call exceeded its timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The broker, session or server was stopped while the call was pending
    #[error("Stopped")]
    Stopped,

    /// Changelog storage errors
    #[error("Changelog error: {0}")]
    Changelog(String),

    /// Out-of-order append for one replica: the CSN issuer is broken
    #[error("Changelog order violation for replica {replica_id}: {attempted} is not after {last}")]
    ChangelogOrder {
        /// Replica whose log rejected the append
        replica_id: i32,
        /// Last CSN already stored
        last: Csn,
        /// CSN that was rejected
        attempted: Csn,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed distinguished name
    #[error("Invalid DN: {0}")]
    InvalidDn(String),

    /// Malformed LDIF entry
    #[error("Invalid LDIF: {0}")]
    InvalidLdif(String),

    /// A second import/export was requested while one is running
    #[error("Simultaneous import/export rejected: an initialization is already in progress")]
    SimultaneousImportExport,

    /// The requested source or target is not connected to the topology
    #[error("No reachable peer in domain {base_dn} for server {server_id}")]
    NoReachablePeer {
        /// Domain base DN
        base_dn: String,
        /// Requested server
        server_id: i32,
    },

    /// Export to all servers requested but nobody else is connected
    #[error("No remote directory server connected in domain {0}")]
    NoRemotes(String),

    /// Source server structurally invalid (e.g. the local server)
    #[error("Invalid import source {0}")]
    InvalidImportSource(i32),

    /// No replication domain is configured for the base DN
    #[error("No matching domain for {0}")]
    NoMatchingDomain(String),

    /// Bulk transfer aborted mid-flight
    #[error("Total update failed: {0}")]
    TransferFailed(String),

    /// Storage engine refused an operation
    #[error("Backend error ({code:?}): {message}")]
    Backend {
        /// Result code returned by the storage engine
        code: ResultCode,
        /// Human readable detail
        message: String,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a changelog error
    pub fn changelog(msg: impl Into<String>) -> Self {
        Self::Changelog(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transfer error
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferFailed(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the broker should simply reconnect and carry on
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout(_) => true,
            Error::Io(io_error) => matches!(
                io_error.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Result code reported on administrative task entries
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::InvalidDn(_) => ResultCode::InvalidDnSyntax,
            Error::NoReachablePeer { .. } | Error::NoRemotes(_) => ResultCode::UnwillingToPerform,
            Error::Backend { code, .. } => *code,
            Error::Timeout(_) => ResultCode::TimeLimitExceeded,
            _ => ResultCode::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::connection("reset").is_retryable());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!Error::protocol("bad version").is_retryable());
        assert!(!Error::SimultaneousImportExport.is_retryable());
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(
            Error::NoMatchingDomain("dc=x".into()).result_code(),
            ResultCode::Other
        );
        assert_eq!(
            Error::NoRemotes("dc=x".into()).result_code(),
            ResultCode::UnwillingToPerform
        );
        assert_eq!(Error::InvalidDn("x".into()).result_code(), ResultCode::InvalidDnSyntax);
        assert_eq!(Error::SimultaneousImportExport.result_code(), ResultCode::Other);
    }

    #[test]
    fn test_error_messages() {
        let err = Error::NoReachablePeer {
            base_dn: "dc=example,dc=com".into(),
            server_id: 7,
        };
        assert!(err.to_string().contains("No reachable peer"));
        assert!(Error::SimultaneousImportExport
            .to_string()
            .contains("Simultaneous import/export rejected"));
    }
}
