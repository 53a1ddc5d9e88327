//! EPATH encoding
//!
//! Logical segments take the 2-byte form when the value fits in 8 bits and
//! the 4-byte padded form otherwise. Symbolic segments use the ANSI
//! Extended format with a trailing pad byte for odd-length names.

use bytes::BufMut;
use serde::Serialize;

use crate::error::{Error, Result};

const SEG_CLASS_8: u8 = 0x20;
const SEG_CLASS_16: u8 = 0x21;
const SEG_INSTANCE_8: u8 = 0x24;
const SEG_INSTANCE_16: u8 = 0x25;
const SEG_MEMBER_8: u8 = 0x28;
const SEG_MEMBER_16: u8 = 0x29;
const SEG_ATTRIBUTE_8: u8 = 0x30;
const SEG_ATTRIBUTE_16: u8 = 0x31;
const SEG_SYMBOLIC: u8 = 0x91;

/// One EPATH segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathSegment {
    Class(u16),
    Instance(u16),
    Attribute(u16),
    Member(u16),
    Symbolic(String),
}

/// An ordered CIP object path.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CipPath {
    segments: Vec<PathSegment>,
}

impl CipPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    pub fn class_instance(class: u16, instance: u16) -> Self {
        Self::new(vec![PathSegment::Class(class), PathSegment::Instance(instance)])
    }

    pub fn class_instance_attribute(class: u16, instance: u16, attribute: u16) -> Self {
        Self::new(vec![
            PathSegment::Class(class),
            PathSegment::Instance(instance),
            PathSegment::Attribute(attribute),
        ])
    }

    pub fn symbolic(tag: impl Into<String>) -> Self {
        Self::new(vec![PathSegment::Symbolic(tag.into())])
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Encode to bytes. The result is always an even number of bytes. A
    /// path that yields no segment is invalid.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.segments.is_empty() {
            return Err(Error::config("CIP path yields no segments"));
        }
        let mut buf = Vec::with_capacity(self.segments.len() * 4);
        for segment in &self.segments {
            match segment {
                PathSegment::Class(v) => put_logical(&mut buf, SEG_CLASS_8, SEG_CLASS_16, *v),
                PathSegment::Instance(v) => {
                    put_logical(&mut buf, SEG_INSTANCE_8, SEG_INSTANCE_16, *v)
                }
                PathSegment::Attribute(v) => {
                    put_logical(&mut buf, SEG_ATTRIBUTE_8, SEG_ATTRIBUTE_16, *v)
                }
                PathSegment::Member(v) => put_logical(&mut buf, SEG_MEMBER_8, SEG_MEMBER_16, *v),
                PathSegment::Symbolic(tag) => put_symbolic(&mut buf, tag)?,
            }
        }
        Ok(buf)
    }

    /// Path length in 16-bit words, as carried in CIP request headers.
    pub fn words(&self) -> Result<u8> {
        let bytes = self.encode()?.len();
        let words = bytes / 2;
        if words > u8::MAX as usize {
            return Err(Error::config(format!("CIP path of {} words does not fit", words)));
        }
        Ok(words as u8)
    }

    /// Decode a path that must consume the whole buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut rest = buf;
        let mut segments = Vec::new();
        while !rest.is_empty() {
            let (segment, advanced) = take_segment(rest)?;
            segments.push(segment);
            rest = &rest[advanced..];
        }
        if segments.is_empty() {
            return Err(Error::malformed("empty EPATH"));
        }
        Ok(Self { segments })
    }
}

impl std::fmt::Display for CipPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            match segment {
                PathSegment::Class(v) => write!(f, "class:0x{:02X}", v)?,
                PathSegment::Instance(v) => write!(f, "instance:{}", v)?,
                PathSegment::Attribute(v) => write!(f, "attribute:{}", v)?,
                PathSegment::Member(v) => write!(f, "member:{}", v)?,
                PathSegment::Symbolic(tag) => write!(f, "tag:{}", tag)?,
            }
        }
        Ok(())
    }
}

fn put_logical(buf: &mut Vec<u8>, header8: u8, header16: u8, value: u16) {
    if value <= u8::MAX as u16 {
        buf.put_u8(header8);
        buf.put_u8(value as u8);
    } else {
        buf.put_u8(header16);
        buf.put_u8(0); // pad
        buf.put_u16_le(value);
    }
}

fn put_symbolic(buf: &mut Vec<u8>, tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > u8::MAX as usize {
        return Err(Error::config(format!(
            "symbolic segment of {} characters",
            tag.len()
        )));
    }
    if !tag.is_ascii() {
        return Err(Error::config(format!("symbolic segment {:?} is not ASCII", tag)));
    }
    buf.put_u8(SEG_SYMBOLIC);
    buf.put_u8(tag.len() as u8);
    buf.put_slice(tag.as_bytes());
    if tag.len() % 2 != 0 {
        buf.put_u8(0);
    }
    Ok(())
}

/// Decode one segment, returning it plus the bytes consumed.
fn take_segment(buf: &[u8]) -> Result<(PathSegment, usize)> {
    let header = buf[0];
    match header {
        SEG_SYMBOLIC => {
            if buf.len() < 2 {
                return Err(Error::malformed("symbolic segment truncated"));
            }
            let len = buf[1] as usize;
            if len == 0 {
                return Err(Error::malformed("symbolic segment with zero length"));
            }
            let padded = len + len % 2;
            if buf.len() < 2 + padded {
                return Err(Error::malformed("symbolic segment shorter than its length byte"));
            }
            let tag = std::str::from_utf8(&buf[2..2 + len])
                .map_err(|_| Error::malformed("symbolic segment is not ASCII"))?
                .to_string();
            if !tag.is_ascii() {
                return Err(Error::malformed("symbolic segment is not ASCII"));
            }
            Ok((PathSegment::Symbolic(tag), 2 + padded))
        }
        SEG_CLASS_8 | SEG_INSTANCE_8 | SEG_ATTRIBUTE_8 | SEG_MEMBER_8 => {
            if buf.len() < 2 {
                return Err(Error::malformed("logical segment truncated"));
            }
            let value = buf[1] as u16;
            Ok((logical_segment(header & !0x01, value), 2))
        }
        SEG_CLASS_16 | SEG_INSTANCE_16 | SEG_ATTRIBUTE_16 | SEG_MEMBER_16 => {
            if buf.len() < 4 {
                return Err(Error::malformed("16-bit logical segment truncated"));
            }
            let value = u16::from_le_bytes([buf[2], buf[3]]);
            Ok((logical_segment(header & !0x01, value), 4))
        }
        other => Err(Error::malformed(format!(
            "unsupported EPATH segment header 0x{:02X}",
            other
        ))),
    }
}

fn logical_segment(base: u8, value: u16) -> PathSegment {
    match base {
        SEG_CLASS_8 => PathSegment::Class(value),
        SEG_INSTANCE_8 => PathSegment::Instance(value),
        SEG_ATTRIBUTE_8 => PathSegment::Attribute(value),
        _ => PathSegment::Member(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_8bit_width_selection() {
        let path = CipPath::class_instance(5, 1);
        assert_eq!(path.encode().unwrap(), vec![0x20, 0x05, 0x24, 0x01]);
        assert_eq!(path.words().unwrap(), 2);
    }

    #[test]
    fn test_16bit_width_selection_with_pad() {
        let path = CipPath::new(vec![PathSegment::Class(0x1234)]);
        assert_eq!(path.encode().unwrap(), vec![0x21, 0x00, 0x34, 0x12]);
    }

    #[test]
    fn test_boundary_values() {
        // 255 still takes the short form, 256 the padded form
        let short = CipPath::new(vec![PathSegment::Instance(0xFF)]);
        assert_eq!(short.encode().unwrap(), vec![0x24, 0xFF]);
        let wide = CipPath::new(vec![PathSegment::Instance(0x100)]);
        assert_eq!(wide.encode().unwrap(), vec![0x25, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_symbolic_even_length_no_pad() {
        let path = CipPath::symbolic("Assembly_A");
        let mut expected = vec![0x91, 0x0A];
        expected.extend_from_slice(b"Assembly_A");
        assert_eq!(path.encode().unwrap(), expected);

        let path = CipPath::symbolic("Tag1");
        assert_eq!(path.encode().unwrap(), vec![0x91, 0x04, b'T', b'a', b'g', b'1']);

        let path = CipPath::symbolic("AB");
        assert_eq!(path.encode().unwrap(), vec![0x91, 0x02, b'A', b'B']);
    }

    #[test]
    fn test_symbolic_odd_length_pads() {
        let path = CipPath::symbolic("AbC");
        assert_eq!(path.encode().unwrap(), vec![0x91, 0x03, b'A', b'b', b'C', 0x00]);
        assert_eq!(path.words().unwrap(), 3);
    }

    #[test]
    fn test_empty_path_rejected_on_encode() {
        let err = CipPath::default().encode().unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_decode_round_trip() {
        let path = CipPath::new(vec![
            PathSegment::Class(0x04),
            PathSegment::Instance(0x1234),
            PathSegment::Attribute(3),
            PathSegment::Member(300),
            PathSegment::Symbolic("Pump_1".to_string()),
        ]);
        let decoded = CipPath::decode(&path.encode().unwrap()).unwrap();
        assert_eq!(decoded, path);
    }

    #[test]
    fn test_decode_odd_symbolic_consumes_pad() {
        let encoded = CipPath::symbolic("AbC").encode().unwrap();
        let decoded = CipPath::decode(&encoded).unwrap();
        assert_eq!(decoded.segments(), &[PathSegment::Symbolic("AbC".to_string())]);
    }

    #[test]
    fn test_decode_unknown_header_is_malformed() {
        let err = CipPath::decode(&[0x42, 0x00]).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_decode_truncated_segment_is_malformed() {
        assert!(CipPath::decode(&[0x21, 0x00, 0x34]).is_err());
        assert!(CipPath::decode(&[0x91, 0x05, b'a', b'b']).is_err());
    }
}
