//! CIP message layer
//!
//! Message Router request/reply framing, general status handling, and the
//! Connection Manager bodies (Forward Open, Forward Close, Unconnected
//! Send) used for Class 3 explicit messaging.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::codec::epath::{CipPath, PathSegment};
use crate::error::{Error, Result};

/// CIP service codes used by this client.
pub mod service {
    pub const GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
    pub const SET_ATTRIBUTE_SINGLE: u8 = 0x10;
    pub const FORWARD_CLOSE: u8 = 0x4E;
    pub const UNCONNECTED_SEND: u8 = 0x52;
    pub const FORWARD_OPEN: u8 = 0x54;

    /// Bit set on the service code of every reply.
    pub const REPLY_FLAG: u8 = 0x80;
}

/// Connection Manager object: class 0x06, instance 1.
pub fn connection_manager_path() -> CipPath {
    CipPath::class_instance(0x06, 1)
}

/// Message Router object: class 0x02, instance 1. Used as the Forward
/// Open connection path for explicit messaging.
pub fn message_router_path() -> CipPath {
    CipPath::class_instance(0x02, 1)
}

/// CIP general status plus the first extended status word, if any.
/// A non-zero general status is a returned value, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CipStatus {
    pub general: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended: Option<u16>,
}

impl CipStatus {
    pub const SUCCESS: CipStatus = CipStatus {
        general: 0,
        extended: None,
    };

    pub fn is_success(&self) -> bool {
        self.general == 0
    }

    /// Human-readable name for the general status code.
    pub fn describe(&self) -> &'static str {
        match self.general {
            0x00 => "success",
            0x01 => "connection_failure",
            0x02 => "resource_unavailable",
            0x03 => "invalid_parameter_value",
            0x04 => "path_segment_error",
            0x05 => "path_destination_unknown",
            0x08 => "service_not_supported",
            0x09 => "invalid_attribute_value",
            0x0C => "object_state_conflict",
            0x0E => "attribute_not_settable",
            0x10 => "device_state_conflict",
            0x13 => "not_enough_data",
            0x14 => "attribute_not_supported",
            0x15 => "too_much_data",
            0x1E => "embedded_service_error",
            0x26 => "invalid_path_size",
            _ => "vendor_or_reserved",
        }
    }
}

impl std::fmt::Display for CipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.extended {
            Some(ext) => write!(f, "0x{:02X} ({}, ext 0x{:04X})", self.general, self.describe(), ext),
            None => write!(f, "0x{:02X} ({})", self.general, self.describe()),
        }
    }
}

/// A Message Router request: service, path, service data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipRequest {
    pub service: u8,
    pub path: CipPath,
    pub data: Vec<u8>,
}

impl CipRequest {
    pub fn new(service: u8, path: CipPath, data: Vec<u8>) -> Self {
        Self { service, path, data }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.path.encode()?;
        let mut buf = BytesMut::with_capacity(2 + path.len() + self.data.len());
        buf.put_u8(self.service);
        buf.put_u8((path.len() / 2) as u8);
        buf.put_slice(&path);
        buf.put_slice(&self.data);
        Ok(buf.to_vec())
    }

    /// Decode a request. The path must consume exactly the declared word
    /// count.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::malformed("CIP request shorter than service + path size"));
        }
        let service = buf[0];
        let path_bytes = buf[1] as usize * 2;
        if buf.len() < 2 + path_bytes {
            return Err(Error::malformed(format!(
                "CIP request declares a {}-byte path but {} bytes remain",
                path_bytes,
                buf.len() - 2
            )));
        }
        let path = CipPath::decode(&buf[2..2 + path_bytes])?;
        Ok(Self {
            service,
            path,
            data: buf[2 + path_bytes..].to_vec(),
        })
    }
}

/// A Message Router reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipReply {
    /// Original service code, reply flag stripped.
    pub service: u8,
    pub status: CipStatus,
    pub data: Vec<u8>,
}

impl CipReply {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::malformed("CIP reply shorter than its fixed header"));
        }
        let mut buf = buf;
        let service_echo = buf.get_u8();
        if service_echo & service::REPLY_FLAG == 0 {
            return Err(Error::malformed(format!(
                "CIP reply service 0x{:02X} lacks the reply flag",
                service_echo
            )));
        }
        let _reserved = buf.get_u8();
        let general = buf.get_u8();
        let extended_words = buf.get_u8() as usize;
        if buf.len() < extended_words * 2 {
            return Err(Error::malformed(format!(
                "CIP reply declares {} extended status words but {} bytes remain",
                extended_words,
                buf.len()
            )));
        }
        let mut extended = None;
        for i in 0..extended_words {
            let word = buf.get_u16_le();
            if i == 0 {
                extended = Some(word);
            }
        }
        Ok(Self {
            service: service_echo & !service::REPLY_FLAG,
            status: CipStatus { general, extended },
            data: buf.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.data.len());
        buf.put_u8(self.service | service::REPLY_FLAG);
        buf.put_u8(0);
        buf.put_u8(self.status.general);
        match self.status.extended {
            Some(ext) => {
                buf.put_u8(1);
                buf.put_u16_le(ext);
            }
            None => buf.put_u8(0),
        }
        buf.put_slice(&self.data);
        buf.to_vec()
    }
}

/// Network connection parameters for a Class 3 explicit connection:
/// point-to-point, low priority, variable size, 500 bytes.
pub const CLASS3_NETWORK_PARAMS: u16 = 0x43F4;

/// Transport class/trigger for Class 3 explicit messaging: server class 3,
/// application-triggered.
pub const CLASS3_TRANSPORT_TRIGGER: u8 = 0xA3;

const DEFAULT_PRIORITY_TIME_TICK: u8 = 0x0A;
const DEFAULT_TIMEOUT_TICKS: u8 = 0x0E;
const DEFAULT_RPI_US: u32 = 1_000_000;
const DEFAULT_TIMEOUT_MULTIPLIER: u8 = 1;

/// Forward Open request body (service 0x54 on the Connection Manager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpenRequest {
    pub priority_time_tick: u8,
    pub timeout_ticks: u8,
    pub o_t_connection_id: u32,
    pub t_o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub timeout_multiplier: u8,
    pub o_t_rpi_us: u32,
    pub o_t_params: u16,
    pub t_o_rpi_us: u32,
    pub t_o_params: u16,
    pub transport_trigger: u8,
    pub connection_path: CipPath,
}

impl ForwardOpenRequest {
    /// Class 3 explicit-messaging defaults. The target assigns the O→T id;
    /// the originator proposes the T→O id and the connection serial.
    pub fn class3(
        t_o_connection_id: u32,
        connection_serial: u16,
        vendor_id: u16,
        originator_serial: u32,
    ) -> Self {
        Self {
            priority_time_tick: DEFAULT_PRIORITY_TIME_TICK,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            o_t_connection_id: 0,
            t_o_connection_id,
            connection_serial,
            vendor_id,
            originator_serial,
            timeout_multiplier: DEFAULT_TIMEOUT_MULTIPLIER,
            o_t_rpi_us: DEFAULT_RPI_US,
            o_t_params: CLASS3_NETWORK_PARAMS,
            t_o_rpi_us: DEFAULT_RPI_US,
            t_o_params: CLASS3_NETWORK_PARAMS,
            transport_trigger: CLASS3_TRANSPORT_TRIGGER,
            connection_path: message_router_path(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.connection_path.encode()?;
        let mut buf = BytesMut::with_capacity(36 + path.len());
        buf.put_u8(self.priority_time_tick);
        buf.put_u8(self.timeout_ticks);
        buf.put_u32_le(self.o_t_connection_id);
        buf.put_u32_le(self.t_o_connection_id);
        buf.put_u16_le(self.connection_serial);
        buf.put_u16_le(self.vendor_id);
        buf.put_u32_le(self.originator_serial);
        buf.put_u8(self.timeout_multiplier);
        buf.put_slice(&[0u8; 3]); // reserved
        buf.put_u32_le(self.o_t_rpi_us);
        buf.put_u16_le(self.o_t_params);
        buf.put_u32_le(self.t_o_rpi_us);
        buf.put_u16_le(self.t_o_params);
        buf.put_u8(self.transport_trigger);
        buf.put_u8((path.len() / 2) as u8);
        buf.put_slice(&path);
        Ok(buf.to_vec())
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 36 {
            return Err(Error::malformed("Forward Open body truncated"));
        }
        let mut buf = body;
        let priority_time_tick = buf.get_u8();
        let timeout_ticks = buf.get_u8();
        let o_t_connection_id = buf.get_u32_le();
        let t_o_connection_id = buf.get_u32_le();
        let connection_serial = buf.get_u16_le();
        let vendor_id = buf.get_u16_le();
        let originator_serial = buf.get_u32_le();
        let timeout_multiplier = buf.get_u8();
        buf.advance(3);
        let o_t_rpi_us = buf.get_u32_le();
        let o_t_params = buf.get_u16_le();
        let t_o_rpi_us = buf.get_u32_le();
        let t_o_params = buf.get_u16_le();
        let transport_trigger = buf.get_u8();
        let path_words = buf.get_u8() as usize;
        if buf.len() != path_words * 2 {
            return Err(Error::malformed("Forward Open connection path size mismatch"));
        }
        let connection_path = CipPath::decode(buf)?;
        Ok(Self {
            priority_time_tick,
            timeout_ticks,
            o_t_connection_id,
            t_o_connection_id,
            connection_serial,
            vendor_id,
            originator_serial,
            timeout_multiplier,
            o_t_rpi_us,
            o_t_params,
            t_o_rpi_us,
            t_o_params,
            transport_trigger,
            connection_path,
        })
    }
}

/// Forward Open success reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOpenReply {
    pub o_t_connection_id: u32,
    pub t_o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub o_t_api_us: u32,
    pub t_o_api_us: u32,
}

impl ForwardOpenReply {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 26 {
            return Err(Error::malformed("Forward Open reply truncated"));
        }
        let mut buf = body;
        let o_t_connection_id = buf.get_u32_le();
        let t_o_connection_id = buf.get_u32_le();
        let connection_serial = buf.get_u16_le();
        let vendor_id = buf.get_u16_le();
        let originator_serial = buf.get_u32_le();
        let o_t_api_us = buf.get_u32_le();
        let t_o_api_us = buf.get_u32_le();
        // application reply size + reserved + application data follow;
        // nothing in them is needed for explicit messaging
        Ok(Self {
            o_t_connection_id,
            t_o_connection_id,
            connection_serial,
            vendor_id,
            originator_serial,
            o_t_api_us,
            t_o_api_us,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u32_le(self.o_t_connection_id);
        buf.put_u32_le(self.t_o_connection_id);
        buf.put_u16_le(self.connection_serial);
        buf.put_u16_le(self.vendor_id);
        buf.put_u32_le(self.originator_serial);
        buf.put_u32_le(self.o_t_api_us);
        buf.put_u32_le(self.t_o_api_us);
        buf.put_u8(0); // application reply size
        buf.put_u8(0); // reserved
        buf.to_vec()
    }
}

/// Forward Close request body (service 0x4E on the Connection Manager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCloseRequest {
    pub priority_time_tick: u8,
    pub timeout_ticks: u8,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub connection_path: CipPath,
}

impl ForwardCloseRequest {
    pub fn new(connection_serial: u16, vendor_id: u16, originator_serial: u32) -> Self {
        Self {
            priority_time_tick: DEFAULT_PRIORITY_TIME_TICK,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            connection_serial,
            vendor_id,
            originator_serial,
            connection_path: message_router_path(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.connection_path.encode()?;
        let mut buf = BytesMut::with_capacity(12 + path.len());
        buf.put_u8(self.priority_time_tick);
        buf.put_u8(self.timeout_ticks);
        buf.put_u16_le(self.connection_serial);
        buf.put_u16_le(self.vendor_id);
        buf.put_u32_le(self.originator_serial);
        buf.put_u8((path.len() / 2) as u8);
        buf.put_u8(0); // reserved
        buf.put_slice(&path);
        Ok(buf.to_vec())
    }
}

/// Wrap a request in an Unconnected Send (service 0x52) through the
/// Connection Manager with a one-hop route (port 1, link address 0).
pub fn wrap_unconnected_send(inner: &CipRequest) -> Result<CipRequest> {
    let embedded = inner.encode()?;
    let mut buf = BytesMut::with_capacity(8 + embedded.len());
    buf.put_u8(DEFAULT_PRIORITY_TIME_TICK);
    buf.put_u8(DEFAULT_TIMEOUT_TICKS);
    buf.put_u16_le(embedded.len() as u16);
    buf.put_slice(&embedded);
    if embedded.len() % 2 != 0 {
        buf.put_u8(0);
    }
    buf.put_u8(1); // route path size in words
    buf.put_u8(0); // reserved
    buf.put_u8(0x01); // port segment: port 1
    buf.put_u8(0x00); // link address 0
    Ok(CipRequest::new(
        service::UNCONNECTED_SEND,
        connection_manager_path(),
        buf.to_vec(),
    ))
}

/// Assembly object data attribute path: class 0x04 by convention.
pub fn assembly_data_path(class_id: u16, instance_id: u16) -> CipPath {
    CipPath::new(vec![
        PathSegment::Class(class_id),
        PathSegment::Instance(instance_id),
        PathSegment::Attribute(3),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding_matches_reference_frame() {
        // Get_Attribute_Single on class 4 / instance 1 / attribute 3
        let request = CipRequest::new(
            service::GET_ATTRIBUTE_SINGLE,
            assembly_data_path(4, 1),
            Vec::new(),
        );
        assert_eq!(
            request.encode().unwrap(),
            vec![0x0E, 0x03, 0x20, 0x04, 0x24, 0x01, 0x30, 0x03]
        );
    }

    #[test]
    fn test_request_round_trip() {
        let request = CipRequest::new(
            service::SET_ATTRIBUTE_SINGLE,
            assembly_data_path(4, 0x1234),
            vec![0xFF, 0x00],
        );
        let decoded = CipRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_with_wrong_path_size_is_malformed() {
        let mut encoded = CipRequest::new(
            service::GET_ATTRIBUTE_SINGLE,
            assembly_data_path(4, 1),
            Vec::new(),
        )
        .encode()
        .unwrap();
        encoded[1] = 5; // declares more words than present
        assert!(matches!(
            CipRequest::decode(&encoded).unwrap_err(),
            Error::MalformedFrame(_)
        ));
    }

    #[test]
    fn test_reply_decode_success() {
        let reply = CipReply {
            service: service::GET_ATTRIBUTE_SINGLE,
            status: CipStatus::SUCCESS,
            data: vec![0x11, 0x22],
        };
        let decoded = CipReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded, reply);
        assert!(decoded.status.is_success());
    }

    #[test]
    fn test_reply_decode_with_extended_status() {
        let reply = CipReply {
            service: service::FORWARD_OPEN,
            status: CipStatus {
                general: 0x01,
                extended: Some(0x0100),
            },
            data: Vec::new(),
        };
        let decoded = CipReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.status.general, 0x01);
        assert_eq!(decoded.status.extended, Some(0x0100));
    }

    #[test]
    fn test_reply_without_reply_flag_is_malformed() {
        let buf = [service::GET_ATTRIBUTE_SINGLE, 0, 0, 0];
        assert!(matches!(
            CipReply::decode(&buf).unwrap_err(),
            Error::MalformedFrame(_)
        ));
    }

    #[test]
    fn test_status_describes_object_state_conflict() {
        let status = CipStatus {
            general: 0x0C,
            extended: None,
        };
        assert_eq!(status.describe(), "object_state_conflict");
        assert!(!status.is_success());
    }

    #[test]
    fn test_forward_open_round_trip() {
        let request = ForwardOpenRequest::class3(0x55667788, 0x0102, 0x00FA, 0xCAFE0001);
        let decoded = ForwardOpenRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.transport_trigger, CLASS3_TRANSPORT_TRIGGER);
        assert_eq!(decoded.o_t_params, CLASS3_NETWORK_PARAMS);
    }

    #[test]
    fn test_forward_open_reply_parses_connection_ids() {
        let reply = ForwardOpenReply {
            o_t_connection_id: 0x11223344,
            t_o_connection_id: 0x55667788,
            connection_serial: 0x0102,
            vendor_id: 0x00FA,
            originator_serial: 0xCAFE0001,
            o_t_api_us: 1_000_000,
            t_o_api_us: 1_000_000,
        };
        let decoded = ForwardOpenReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.o_t_connection_id, 0x11223344);
        assert_eq!(decoded.t_o_connection_id, 0x55667788);
    }

    #[test]
    fn test_forward_close_body_layout() {
        let encoded = ForwardCloseRequest::new(0x0102, 0x00FA, 0xCAFE0001)
            .encode()
            .unwrap();
        // fixed header then 2-word path with its pad byte
        assert_eq!(encoded.len(), 10 + 2 + 4);
        assert_eq!(encoded[10], 2); // path words
        assert_eq!(&encoded[12..], &[0x20, 0x02, 0x24, 0x01]);
    }

    #[test]
    fn test_unconnected_send_wrapper_layout() {
        let inner = CipRequest::new(
            service::GET_ATTRIBUTE_SINGLE,
            assembly_data_path(4, 1),
            Vec::new(),
        );
        let wrapped = wrap_unconnected_send(&inner).unwrap();
        assert_eq!(wrapped.service, service::UNCONNECTED_SEND);
        assert_eq!(wrapped.path, connection_manager_path());
        let body = &wrapped.data;
        // embedded size at offset 2, even 8-byte message, no pad
        assert_eq!(u16::from_le_bytes([body[2], body[3]]), 8);
        assert_eq!(&body[4..12], &inner.encode().unwrap()[..]);
        assert_eq!(&body[12..], &[1, 0, 0x01, 0x00]);
    }

    #[test]
    fn test_unconnected_send_pads_odd_embedded_message() {
        let inner = CipRequest::new(
            service::SET_ATTRIBUTE_SINGLE,
            assembly_data_path(4, 1),
            vec![0xFF],
        );
        let wrapped = wrap_unconnected_send(&inner).unwrap();
        let body = &wrapped.data;
        let embedded_len = u16::from_le_bytes([body[2], body[3]]) as usize;
        assert_eq!(embedded_len % 2, 1);
        // pad byte sits between the embedded message and the route path
        assert_eq!(body[4 + embedded_len], 0);
        assert_eq!(&body[4 + embedded_len + 1..], &[1, 0, 0x01, 0x00]);
    }
}
