//! Typed failures for delivery.
//!
//! The worker only needs to know how far a failure reaches:
//!
//! - [`HostError`]: the remote host could not be reached or the session
//!   broke. The host is penalised with backoff and the session ends.
//! - [`MessageError`]: the remote host answered and refused one message.
//!   That item is dropped; the host and session carry on.
//! - [`DeliveryError::Cancelled`]: a stop was requested mid-operation.
//!   No penalty is applied.
//! - [`SystemError`]: a local fault (storage, database).
//! - [`ConfigError`]: settings refused when the relay is opened.

use std::time::Duration;

use carrier_smtp::ClientError;
use carrier_store::StoreError;
use thiserror::Error;

use crate::{config::ConfigError, db::DatabaseError, dns::DnsError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Host failure: {0}")]
    Host(#[from] HostError),

    #[error("Message failure: {0}")]
    Message(#[from] MessageError),

    #[error("Delivery cancelled")]
    Cancelled,

    #[error("System error: {0}")]
    System(#[from] SystemError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Unable to connect to a mail server for {host}")]
    Unreachable { host: String },

    #[error("{server} refused the session with {code}: {message}")]
    HandshakeRejected {
        server: String,
        code: u16,
        message: String,
    },

    #[error("Connection failed: {0}")]
    Transport(ClientError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Rejected with {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("{0}")]
    Database(#[from] DatabaseError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] DnsError),
}

/// How far a failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureLevel {
    Host,
    Message,
}

impl DeliveryError {
    /// `None` for cancellation and local faults, which are neither the
    /// host's nor the message's doing.
    #[must_use]
    pub const fn level(&self) -> Option<FailureLevel> {
        match self {
            Self::Host(_) => Some(FailureLevel::Host),
            Self::Message(_) => Some(FailureLevel::Message),
            Self::Cancelled | Self::System(_) | Self::Config(_) => None,
        }
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The stored body is gone, so retrying can never succeed.
    #[must_use]
    pub const fn is_missing_body(&self) -> bool {
        matches!(self, Self::System(SystemError::Storage(StoreError::NotFound(_))))
    }

    #[must_use]
    pub const fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Self::System(SystemError::Database(DatabaseError::LeaseLost(_)))
        )
    }
}

/// Replies of 4xx/5xx are the server judging the message; everything else
/// the client can report means the session itself is unusable.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } => {
                Self::Message(MessageError::Rejected { code, message })
            }
            other => Self::Host(HostError::Transport(other)),
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Storage(error))
    }
}

impl From<DatabaseError> for DeliveryError {
    fn from(error: DatabaseError) -> Self {
        Self::System(SystemError::Database(error))
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        Self::System(SystemError::Resolver(error))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn mailbox_busy_is_message_level() {
        let err: DeliveryError = ClientError::SmtpError {
            code: 450,
            message: "Mailbox busy".to_string(),
        }
        .into();

        assert_eq!(err.level(), Some(FailureLevel::Message));
        assert_eq!(
            err.to_string(),
            "Message failure: Rejected with 450: Mailbox busy"
        );
    }

    #[test]
    fn permanent_rejection_is_message_level() {
        let err: DeliveryError = ClientError::SmtpError {
            code: 550,
            message: "User unknown".to_string(),
        }
        .into();
        assert_eq!(err.level(), Some(FailureLevel::Message));
    }

    #[test]
    fn connection_reset_is_host_level() {
        let err: DeliveryError =
            ClientError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")).into();
        assert_eq!(err.level(), Some(FailureLevel::Host));
        assert_eq!(err.to_string(), "Host failure: Connection failed: IO error: reset");
    }

    #[test]
    fn protocol_garbage_is_host_level() {
        let err: DeliveryError = ClientError::ParseError("bad line".to_string()).into();
        assert_eq!(err.level(), Some(FailureLevel::Host));

        let err: DeliveryError = ClientError::ConnectionClosed.into();
        assert_eq!(err.level(), Some(FailureLevel::Host));
    }

    #[test]
    fn timeouts_are_host_level() {
        let err: DeliveryError = HostError::Timeout {
            operation: "DATA",
            after: Duration::from_secs(120),
        }
        .into();
        assert_eq!(err.level(), Some(FailureLevel::Host));
        assert_eq!(err.to_string(), "Host failure: DATA timed out after 120s");
    }

    #[test]
    fn cancellation_and_local_faults_have_no_level() {
        assert_eq!(DeliveryError::Cancelled.level(), None);

        let missing: DeliveryError = StoreError::NotFound("body x".to_string()).into();
        assert_eq!(missing.level(), None);
        assert!(missing.is_missing_body());

        let lost: DeliveryError = DatabaseError::LeaseLost("example.com".to_string()).into();
        assert!(lost.is_lease_lost());
    }
}
