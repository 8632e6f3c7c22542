use thiserror::Error;

/// Errors that can occur when talking to a lock
#[derive(Error, Debug)]
pub enum LockError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Lock not found among the adapter's known peripherals
    #[error("Lock not found: {address}")]
    DeviceNotFound {
        /// Address that was looked up
        address: String,
    },

    /// Transport refused or dropped the connection
    #[error("Failed to connect to lock: {0}")]
    ConnectionFailed(String),

    /// Lock disconnected while an operation was outstanding
    #[error("Lock disconnected")]
    Disconnected,

    /// Bad key/slot or handshake rejected by the lock
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed frame, integrity failure or unexpected reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Status byte outside the 4-bit code space
    #[error("{kind} status byte {value:#04x} is out of range")]
    StatusOutOfRange {
        /// Which status space was being decoded
        kind: &'static str,
        /// Offending byte
        value: u8,
    },

    /// No response within the configured bound
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Encrypted advertisement seen but it could not be opened
    #[error("Encrypted advertisement could not be decoded")]
    DecodeAmbiguous,

    /// Another operation holds the session and the policy is to reject
    #[error("Session busy with another operation")]
    Busy,

    /// Session is not in a state that allows the operation
    #[error("Session not ready: {reason}")]
    NotReady {
        /// Reason why the session is not ready
        reason: String,
    },

    /// Operation aborted because the session is being closed
    #[error("Operation cancelled by disconnect")]
    Cancelled,

    /// Invalid caller-supplied parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

/// What a caller can usefully do after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: retrying (possibly after a reconnect) may succeed
    RetryNow,
    /// Credentials were rejected; retry only with a new key/slot
    Reauthenticate,
    /// Firmware or protocol mismatch; retrying will not help
    GiveUp,
}

impl LockError {
    /// Classify this error for retry decisions
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Ble(_)
            | Self::ConnectionFailed(_)
            | Self::Disconnected
            | Self::DeviceNotFound { .. }
            | Self::Timeout { .. }
            | Self::DecodeAmbiguous
            | Self::Busy
            | Self::NotReady { .. }
            | Self::Cancelled => ErrorClass::RetryNow,
            Self::Authentication(_) => ErrorClass::Reauthenticate,
            Self::Protocol(_) | Self::StatusOutOfRange { .. } | Self::InvalidParameters(_) => {
                ErrorClass::GiveUp
            }
        }
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound { .. }
        )
    }

    /// Check if retrying the same call may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::RetryNow)
    }

    /// Check if this error can only be fixed with new credentials
    #[must_use]
    pub const fn requires_reauthentication(&self) -> bool {
        matches!(self.class(), ErrorClass::Reauthenticate)
    }

    /// Whether the session must be torn down after this error.
    ///
    /// Only errors raised before anything reached the wire leave the
    /// session usable.
    pub(crate) const fn poisons_session(&self) -> bool {
        !matches!(
            self,
            Self::InvalidParameters(_) | Self::NotReady { .. } | Self::Busy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = LockError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(connection_error.is_retryable());
        assert!(!connection_error.requires_reauthentication());

        let timeout_error = LockError::Timeout { timeout_ms: 5000 };
        assert!(!timeout_error.is_connection_error());
        assert_eq!(timeout_error.class(), ErrorClass::RetryNow);

        let auth_error = LockError::Authentication("bad key".to_string());
        assert!(!auth_error.is_retryable());
        assert!(auth_error.requires_reauthentication());

        let protocol_error = LockError::StatusOutOfRange {
            kind: "lock",
            value: 0x42,
        };
        assert_eq!(protocol_error.class(), ErrorClass::GiveUp);
    }

    #[test]
    fn test_session_poisoning() {
        assert!(LockError::Timeout { timeout_ms: 1 }.poisons_session());
        assert!(LockError::Protocol("bad".to_string()).poisons_session());
        assert!(!LockError::Busy.poisons_session());
        assert!(!LockError::InvalidParameters("long".to_string()).poisons_session());
    }

    #[test]
    fn test_decode_ambiguous_is_degraded_not_fatal() {
        let error = LockError::DecodeAmbiguous;
        assert!(error.is_retryable());
        assert!(!error.requires_reauthentication());
        assert!(!error.is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let error = LockError::StatusOutOfRange {
            kind: "door",
            value: 0x1F,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("door"));
        assert!(error_string.contains("0x1f"));
    }
}
