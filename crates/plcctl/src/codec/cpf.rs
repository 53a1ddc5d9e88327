//! Common Packet Format
//!
//! Item list carried in SendRRData / SendUnitData payloads. Unknown item
//! types in received frames are preserved verbatim.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

pub const TYPE_NULL_ADDRESS: u16 = 0x0000;
pub const TYPE_CONNECTED_ADDRESS: u16 = 0x00A1;
pub const TYPE_CONNECTION_DATA: u16 = 0x00B1;
pub const TYPE_UNCONNECTED_DATA: u16 = 0x00B2;

/// One CPF item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpfItem {
    NullAddress,
    ConnectedAddress { connection_id: u32 },
    /// Class 3 data item; the wire form starts with a 16-bit sequence count.
    ConnectionData { sequence: u16, data: Vec<u8> },
    UnconnectedData { data: Vec<u8> },
    /// Anything this client does not interpret, kept byte-for-byte.
    Other { type_id: u16, data: Vec<u8> },
}

impl CpfItem {
    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            CpfItem::NullAddress => {
                buf.put_u16_le(TYPE_NULL_ADDRESS);
                buf.put_u16_le(0);
            }
            CpfItem::ConnectedAddress { connection_id } => {
                buf.put_u16_le(TYPE_CONNECTED_ADDRESS);
                buf.put_u16_le(4);
                buf.put_u32_le(*connection_id);
            }
            CpfItem::ConnectionData { sequence, data } => {
                buf.put_u16_le(TYPE_CONNECTION_DATA);
                buf.put_u16_le((data.len() + 2) as u16);
                buf.put_u16_le(*sequence);
                buf.put_slice(data);
            }
            CpfItem::UnconnectedData { data } => {
                buf.put_u16_le(TYPE_UNCONNECTED_DATA);
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
            CpfItem::Other { type_id, data } => {
                buf.put_u16_le(*type_id);
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::malformed("CPF item header truncated"));
        }
        let type_id = buf.get_u16_le();
        let length = buf.get_u16_le() as usize;
        if buf.len() < length {
            return Err(Error::malformed(format!(
                "CPF item 0x{:04X} declares {} bytes but {} remain",
                type_id,
                length,
                buf.len()
            )));
        }
        let (mut data, rest) = buf.split_at(length);
        *buf = rest;
        match type_id {
            TYPE_NULL_ADDRESS => {
                if !data.is_empty() {
                    return Err(Error::malformed("null address item with a body"));
                }
                Ok(CpfItem::NullAddress)
            }
            TYPE_CONNECTED_ADDRESS => {
                if data.len() != 4 {
                    return Err(Error::malformed(format!(
                        "connected address item of {} bytes",
                        data.len()
                    )));
                }
                Ok(CpfItem::ConnectedAddress {
                    connection_id: data.get_u32_le(),
                })
            }
            TYPE_CONNECTION_DATA => {
                if data.len() < 2 {
                    return Err(Error::malformed("connection data item shorter than the sequence count"));
                }
                let sequence = data.get_u16_le();
                Ok(CpfItem::ConnectionData {
                    sequence,
                    data: data.to_vec(),
                })
            }
            TYPE_UNCONNECTED_DATA => Ok(CpfItem::UnconnectedData { data: data.to_vec() }),
            other => Ok(CpfItem::Other {
                type_id: other,
                data: data.to_vec(),
            }),
        }
    }
}

/// SendRRData / SendUnitData payload: interface handle, timeout, item list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendData {
    pub interface_handle: u32,
    pub timeout: u16,
    pub items: Vec<CpfItem>,
}

impl SendData {
    /// Unconnected composition: null address item plus one UCMM data item.
    pub fn unconnected(cip: Vec<u8>) -> Self {
        Self {
            interface_handle: 0,
            timeout: 0,
            items: vec![CpfItem::NullAddress, CpfItem::UnconnectedData { data: cip }],
        }
    }

    /// Connected (Class 3) composition: address item carrying the O→T
    /// connection id plus one sequenced data item.
    pub fn connected(connection_id: u32, sequence: u16, cip: Vec<u8>) -> Self {
        Self {
            interface_handle: 0,
            timeout: 0,
            items: vec![
                CpfItem::ConnectedAddress { connection_id },
                CpfItem::ConnectionData { sequence, data: cip },
            ],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.items.len() * 8);
        buf.put_u32_le(self.interface_handle);
        buf.put_u16_le(self.timeout);
        buf.put_u16_le(self.items.len() as u16);
        for item in &self.items {
            item.encode_into(&mut buf);
        }
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::malformed("SendRR/SendUnit body truncated"));
        }
        let mut buf = payload;
        let interface_handle = buf.get_u32_le();
        let timeout = buf.get_u16_le();
        let item_count = buf.get_u16_le() as usize;
        let mut items = Vec::with_capacity(item_count);
        for _ in 0..item_count {
            items.push(CpfItem::decode(&mut buf)?);
        }
        if !buf.is_empty() {
            return Err(Error::malformed(format!(
                "{} trailing bytes after the last CPF item",
                buf.len()
            )));
        }
        Ok(Self {
            interface_handle,
            timeout,
            items,
        })
    }

    /// Items this client does not interpret, kept for the caller.
    pub fn other_items(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.items.iter().filter_map(|item| match item {
            CpfItem::Other { type_id, data } => Some((*type_id, data.as_slice())),
            _ => None,
        })
    }

    /// Extract the unconnected data item from a reply.
    pub fn unconnected_reply(self) -> Result<Vec<u8>> {
        for item in self.items {
            if let CpfItem::UnconnectedData { data } = item {
                return Ok(data);
            }
        }
        Err(Error::malformed("reply carries no unconnected data item"))
    }

    /// Extract `(connection_id, sequence, data)` from a connected reply.
    pub fn connected_reply(self) -> Result<(u32, u16, Vec<u8>)> {
        let mut connection_id = None;
        let mut sequenced = None;
        for item in self.items {
            match item {
                CpfItem::ConnectedAddress { connection_id: id } => connection_id = Some(id),
                CpfItem::ConnectionData { sequence, data } => sequenced = Some((sequence, data)),
                _ => {}
            }
        }
        match (connection_id, sequenced) {
            (Some(id), Some((sequence, data))) => Ok((id, sequence, data)),
            _ => Err(Error::malformed(
                "connected reply missing address or sequenced data item",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_item_type() {
        let items = vec![
            CpfItem::NullAddress,
            CpfItem::ConnectedAddress {
                connection_id: 0x11223344,
            },
            CpfItem::ConnectionData {
                sequence: 7,
                data: vec![0x0E, 0x02, 0x20, 0x04, 0x24, 0x01],
            },
            CpfItem::UnconnectedData {
                data: vec![0xAA, 0xBB],
            },
            CpfItem::Other {
                type_id: 0x0100,
                data: vec![1, 2, 3],
            },
        ];
        let body = SendData {
            interface_handle: 0,
            timeout: 10,
            items,
        };
        let decoded = SendData::decode(&body.encode()).unwrap();
        assert_eq!(decoded, body);
        assert_eq!(decoded.encode(), body.encode());
    }

    #[test]
    fn test_unknown_item_preserved_verbatim() {
        let body = SendData {
            interface_handle: 0,
            timeout: 0,
            items: vec![CpfItem::Other {
                type_id: 0x8002,
                data: vec![9, 8, 7, 6],
            }],
        };
        let decoded = SendData::decode(&body.encode()).unwrap();
        match &decoded.items[0] {
            CpfItem::Other { type_id, data } => {
                assert_eq!(*type_id, 0x8002);
                assert_eq!(data, &vec![9, 8, 7, 6]);
            }
            other => panic!("expected preserved item, got {:?}", other),
        }
        let surfaced: Vec<_> = decoded.other_items().collect();
        assert_eq!(surfaced, vec![(0x8002, &[9u8, 8, 7, 6][..])]);
    }

    #[test]
    fn test_connected_composition_layout() {
        // seq=1 LE immediately after the item header, per Class 3 framing
        let body = SendData::connected(0x11223344, 1, vec![0x0E]);
        let encoded = body.encode();
        // interface handle + timeout + count
        assert_eq!(&encoded[..8], &[0, 0, 0, 0, 0, 0, 2, 0]);
        // address item: type 0x00A1, len 4, id LE
        assert_eq!(&encoded[8..16], &[0xA1, 0x00, 0x04, 0x00, 0x44, 0x33, 0x22, 0x11]);
        // data item: type 0x00B1, len 3, seq 0x0001 LE, service byte
        assert_eq!(&encoded[16..], &[0xB1, 0x00, 0x03, 0x00, 0x01, 0x00, 0x0E]);
    }

    #[test]
    fn test_item_length_overrun_is_malformed() {
        let mut encoded = SendData::unconnected(vec![1, 2, 3]).encode();
        let last = encoded.len() - 1;
        encoded.truncate(last); // drop one payload byte
        assert!(matches!(
            SendData::decode(&encoded).unwrap_err(),
            Error::MalformedFrame(_)
        ));
    }

    #[test]
    fn test_sequence_shorter_than_two_bytes_is_malformed() {
        // hand-build a B1 item with a 1-byte body
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u16_le(0);
        buf.put_u16_le(1);
        buf.put_u16_le(TYPE_CONNECTION_DATA);
        buf.put_u16_le(1);
        buf.put_u8(0x00);
        assert!(matches!(
            SendData::decode(&buf).unwrap_err(),
            Error::MalformedFrame(_)
        ));
    }

    #[test]
    fn test_reply_extractors() {
        let data = SendData::unconnected(vec![5, 6]).unconnected_reply().unwrap();
        assert_eq!(data, vec![5, 6]);

        let (id, seq, data) = SendData::connected(0xAB, 3, vec![1])
            .connected_reply()
            .unwrap();
        assert_eq!((id, seq), (0xAB, 3));
        assert_eq!(data, vec![1]);

        let missing = SendData::unconnected(vec![]).connected_reply();
        assert!(matches!(missing.unwrap_err(), Error::MalformedFrame(_)));
    }
}
