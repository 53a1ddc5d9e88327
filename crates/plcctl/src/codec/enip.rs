//! ENIP encapsulation layer
//!
//! 24-byte encapsulation header plus command payload. All multi-byte
//! integers on the wire are little-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// Encapsulation header size in bytes.
pub const HEADER_LEN: usize = 24;

/// ENIP protocol version sent in RegisterSession.
pub const PROTOCOL_VERSION: u16 = 1;

/// Recognized encapsulation commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnipCommand {
    Nop,
    ListServices,
    ListIdentity,
    RegisterSession,
    UnregisterSession,
    SendRRData,
    SendUnitData,
}

impl EnipCommand {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(EnipCommand::Nop),
            0x0004 => Some(EnipCommand::ListServices),
            0x0063 => Some(EnipCommand::ListIdentity),
            0x0065 => Some(EnipCommand::RegisterSession),
            0x0066 => Some(EnipCommand::UnregisterSession),
            0x006F => Some(EnipCommand::SendRRData),
            0x0070 => Some(EnipCommand::SendUnitData),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            EnipCommand::Nop => 0x0000,
            EnipCommand::ListServices => 0x0004,
            EnipCommand::ListIdentity => 0x0063,
            EnipCommand::RegisterSession => 0x0065,
            EnipCommand::UnregisterSession => 0x0066,
            EnipCommand::SendRRData => 0x006F,
            EnipCommand::SendUnitData => 0x0070,
        }
    }

    /// Commands that elicit no reply from the peer.
    pub fn fire_and_forget(self) -> bool {
        matches!(self, EnipCommand::Nop | EnipCommand::UnregisterSession)
    }
}

/// Decoded encapsulation header. `length` counts the payload bytes that
/// follow the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnipHeader {
    pub command: EnipCommand,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EnipHeader {
    /// Decode exactly [`HEADER_LEN`] bytes. An unrecognized command is a
    /// framing error in every context this client reads frames.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::malformed(format!(
                "encapsulation header truncated: {} of {} bytes",
                buf.len(),
                HEADER_LEN
            )));
        }
        let mut buf = buf;
        let raw_command = buf.get_u16_le();
        let command = EnipCommand::from_u16(raw_command)
            .ok_or_else(|| Error::malformed(format!("unknown ENIP command 0x{:04X}", raw_command)))?;
        let length = buf.get_u16_le();
        let session_handle = buf.get_u32_le();
        let status = buf.get_u32_le();
        let mut sender_context = [0u8; 8];
        buf.copy_to_slice(&mut sender_context);
        let options = buf.get_u32_le();
        Ok(Self {
            command,
            length,
            session_handle,
            status,
            sender_context,
            options,
        })
    }
}

/// One encapsulation frame: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnipPacket {
    pub command: EnipCommand,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
    pub payload: Vec<u8>,
}

impl EnipPacket {
    /// A request frame with zeroed status, context, and options.
    pub fn request(command: EnipCommand, session_handle: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            session_handle,
            status: 0,
            sender_context: [0u8; 8],
            options: 0,
            payload,
        }
    }

    /// RegisterSession request: protocol version 1, options 0.
    pub fn register_session() -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u16_le(PROTOCOL_VERSION);
        payload.put_u16_le(0);
        Self::request(EnipCommand::RegisterSession, 0, payload.to_vec())
    }

    /// UnregisterSession request for the given handle. No reply follows.
    pub fn unregister_session(session_handle: u32) -> Self {
        Self::request(EnipCommand::UnregisterSession, session_handle, Vec::new())
    }

    /// NOP with an opaque keep-alive pattern. Discarded by the receiver.
    pub fn nop(session_handle: u32, pattern: &[u8]) -> Self {
        Self::request(EnipCommand::Nop, session_handle, pattern.to_vec())
    }

    /// ListServices request.
    pub fn list_services(session_handle: u32) -> Self {
        Self::request(EnipCommand::ListServices, session_handle, Vec::new())
    }

    /// ListIdentity request.
    pub fn list_identity() -> Self {
        Self::request(EnipCommand::ListIdentity, 0, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16_le(self.command.as_u16());
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u32_le(self.session_handle);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.sender_context);
        buf.put_u32_le(self.options);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode a complete frame. The declared length must match the bytes
    /// actually present.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = EnipHeader::decode(buf)?;
        let body = &buf[HEADER_LEN..];
        if body.len() != header.length as usize {
            return Err(Error::malformed(format!(
                "declared payload length {} but {} bytes follow the header",
                header.length,
                body.len()
            )));
        }
        Ok(Self {
            command: header.command,
            session_handle: header.session_handle,
            status: header.status,
            sender_context: header.sender_context,
            options: header.options,
            payload: body.to_vec(),
        })
    }

    /// Parse a RegisterSession reply payload, returning the negotiated
    /// protocol version.
    pub fn decode_register_reply(payload: &[u8]) -> Result<u16> {
        if payload.len() < 4 {
            return Err(Error::malformed("RegisterSession reply shorter than 4 bytes"));
        }
        let mut buf = payload;
        let version = buf.get_u16_le();
        let _options = buf.get_u16_le();
        Ok(version)
    }
}
