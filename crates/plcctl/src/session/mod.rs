//! Session orchestration - table, dispatch, keep-alive
//!
//! A session couples a caller-visible id with a pooled connection per
//! operation, a background keep-alive task, and accumulated diagnostics.

pub(crate) mod heartbeat;
pub mod manager;
pub mod types;

pub use manager::SessionManager;
pub use types::{
    CipExchange, CipTransport, ConnectionDiagnostics, OpenSessionResponse, SessionDiagnostics,
    StatusSummary,
};
