//! Error types for the datapath.

/// Error type for datapath operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request, response or credit return numbered beyond the slot's window.
    ///
    /// The packet has not been applied to any slot state.
    #[error(
        "protocol violation on session {session_num} slot {sslot_idx}: req_num {req_num}, expected at most {expected}"
    )]
    ProtocolViolation {
        session_num: u16,
        sslot_idx: usize,
        req_num: u64,
        expected: u64,
    },

    /// Header magic mismatch: corrupted or foreign buffer.
    #[error("corrupt packet header: expected magic {expected:#x}, got {got:#x}")]
    CorruptHeader { expected: u8, got: u8 },

    #[error("session {0} not found")]
    SessionNotFound(u16),

    #[error("session {0} is not connected")]
    SessionNotConnected(u16),

    #[error("session {0} is in the wrong state for this operation")]
    InvalidSessionState(u16),

    #[error("no free session slot on session {0}")]
    NoFreeSlots(u16),

    /// A client slot has used up the 44-bit request number space.
    #[error("request numbers exhausted on session {0}")]
    ReqNumExhausted(u16),

    #[error("too many sessions (max {0})")]
    TooManySessions(usize),

    #[error("no handler registered for request type {0}")]
    UnknownReqType(u8),

    #[error("message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("buffer too small: required {required} bytes, available {available} bytes")]
    BufferTooSmall { required: usize, available: usize },

    /// A deferred response whose exchange has already been superseded.
    #[error("response handle for session {session_num} req_num {req_num} is stale")]
    StaleResponseHandle { session_num: u16, req_num: u64 },

    #[error("routing info: {0}")]
    RoutingInfo(String),

    #[error("buffer allocation failed: {0}")]
    AllocFailed(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for errors that indicate a broken transport contract or
    /// an internal bug, after which the engine must stop processing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation { .. } | Error::CorruptHeader { .. }
        )
    }
}

/// Result type for datapath operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CorruptHeader {
            expected: 0xb,
            got: 0x3,
        };
        assert_eq!(
            err.to_string(),
            "corrupt packet header: expected magic 0xb, got 0x3"
        );

        let err = Error::MessageTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "message too large: 10 bytes, max 4 bytes");
    }

    #[test]
    fn test_fatal_classification() {
        let violation = Error::ProtocolViolation {
            session_num: 0,
            sslot_idx: 0,
            req_num: 24,
            expected: 8,
        };
        assert!(violation.is_fatal());
        assert!(Error::CorruptHeader { expected: 11, got: 0 }.is_fatal());
        assert!(!Error::NoFreeSlots(0).is_fatal());
        assert!(!Error::SessionNotFound(3).is_fatal());
    }
}
