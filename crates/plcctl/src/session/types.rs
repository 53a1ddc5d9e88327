//! Session-facing types
//!
//! Diagnostics and request descriptors returned across the facade; the
//! external REST surface maps onto these 1:1.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::{CipPath, CipStatus};

/// CIP status as shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<u16>,
}

impl From<CipStatus> for StatusSummary {
    fn from(status: CipStatus) -> Self {
        Self {
            code: status.general,
            extended: status.extended,
        }
    }
}

/// Connection-level diagnostics of a session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDiagnostics {
    pub endpoint: String,
    pub connected: bool,
    /// ENIP session handle from RegisterSession.
    pub enip_connection_id: u32,
    pub o_t_connection_id: u32,
    pub t_o_connection_id: u32,
}

/// Caller-visible view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub session_id: String,
    pub connection: ConnectionDiagnostics,
    pub keep_alive_pattern_hex: String,
    pub keep_alive_active: bool,
    pub last_activity: DateTime<Utc>,
    pub last_status: StatusSummary,
    pub closed: bool,
}

/// Result of opening a session.
#[derive(Debug, Clone, Serialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub diagnostics: SessionDiagnostics,
}

/// How a CIP request travels: unconnected UCMM (optionally tunneled
/// through an Unconnected Send) or the Class 3 connected channel. The
/// codec picks the CPF composition by matching on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipTransport {
    Unconnected { unconnected_send: bool },
    Connected,
}

/// One CIP exchange as dispatched by the session orchestrator.
#[derive(Debug, Clone)]
pub struct CipExchange {
    pub service: u8,
    pub path: CipPath,
    pub data: Vec<u8>,
    pub transport: CipTransport,
}

impl CipExchange {
    pub fn connected(service: u8, path: CipPath, data: Vec<u8>) -> Self {
        Self {
            service,
            path,
            data,
            transport: CipTransport::Connected,
        }
    }

    pub fn unconnected(service: u8, path: CipPath, data: Vec<u8>) -> Self {
        Self {
            service,
            path,
            data,
            transport: CipTransport::Unconnected {
                unconnected_send: false,
            },
        }
    }

    /// Unconnected, tunneled through service 0x52 on the Connection
    /// Manager.
    pub fn unconnected_send(service: u8, path: CipPath, data: Vec<u8>) -> Self {
        Self {
            service,
            path,
            data,
            transport: CipTransport::Unconnected {
                unconnected_send: true,
            },
        }
    }
}
