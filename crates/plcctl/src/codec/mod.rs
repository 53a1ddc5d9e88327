//! Wire codec for the ENIP encapsulation and CIP message layers
//!
//! Pure encode/decode; no I/O. The connection layer composes these into
//! request/response exchanges.

pub mod cip;
pub mod cpf;
pub mod enip;
pub mod epath;

pub use cip::{CipReply, CipRequest, CipStatus};
pub use cpf::{CpfItem, SendData};
pub use enip::{EnipCommand, EnipHeader, EnipPacket};
pub use epath::{CipPath, PathSegment};
