//! Error taxonomy for the PLC session core
//!
//! CIP-level status codes are not errors: a reply with a non-zero general
//! status is returned to the caller as a value. The variants here cover
//! configuration, lookup, transport, protocol framing, pool, and session
//! lifecycle failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration input (XML document, hex payload, path).
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    /// Assembly alias not present in the registry.
    #[error("unknown assembly alias: {0}")]
    UnknownAlias(String),

    /// Session id not present in the session table.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// TCP connect/read/write failure or timeout. Marks the owning
    /// connection Broken.
    #[error("transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// ENIP encapsulation reply carried a non-zero status word.
    #[error("ENIP protocol error: status 0x{status:08X}")]
    EnipProtocol { status: u32 },

    /// RegisterSession was rejected or returned a zero session handle.
    #[error("session registration failed: status 0x{status:08X}")]
    RegisterFailed { status: u32 },

    /// A transport-critical CIP exchange (Forward Open / Forward Close)
    /// came back with a non-zero general status.
    #[error("CIP fault: general 0x{general:02X}, extended {extended:?}")]
    CipFault { general: u8, extended: Option<u16> },

    /// Decode-side invariant violated. Marks the owning connection Broken.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Pool acquisition deadline expired without a free connection.
    #[error("connection pool acquire timed out")]
    PoolTimeout,

    /// Pool has been drained; no further acquisitions are served.
    #[error("connection pool closed")]
    PoolClosed,

    /// Operation issued against a closed session.
    #[error("session closed")]
    SessionClosed,

    /// Operation aborted by deadline or explicit signal.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    pub fn transport(reason: impl Into<String>) -> Self {
        Error::Transport {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn transport_io(reason: impl Into<String>, source: std::io::Error) -> Self {
        Error::Transport {
            reason: reason.into(),
            source: Some(source),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedFrame(reason.into())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Error::ConfigInvalid {
            reason: reason.into(),
        }
    }

    /// Whether this failure invalidates the connection it occurred on.
    ///
    /// Transport and framing failures always do. ENIP/CIP protocol failures
    /// only do so on the transport-critical commands, which is decided at
    /// the call site (`Connection::open`/`connect`/`close` demote
    /// themselves on any failure).
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::MalformedFrame(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaks_connection_classification() {
        assert!(Error::transport("peer reset").breaks_connection());
        assert!(Error::malformed("short header").breaks_connection());
        assert!(!Error::EnipProtocol { status: 0x69 }.breaks_connection());
        assert!(!Error::PoolTimeout.breaks_connection());
        assert!(!Error::SessionClosed.breaks_connection());
    }

    #[test]
    fn test_display_carries_structured_cause() {
        let err = Error::RegisterFailed { status: 0x64 };
        assert!(err.to_string().contains("0x00000064"));

        let err = Error::CipFault {
            general: 0x01,
            extended: Some(0x0204),
        };
        assert!(err.to_string().contains("0x01"));
    }
}
