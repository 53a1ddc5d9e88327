//! CIP service facade
//!
//! Typed helpers over the session orchestrator: attribute access, assembly
//! reads and writes, and layout-aware member decoding.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::cip::{assembly_data_path, service};
use crate::codec::{CipPath, CipStatus};
use crate::error::{Error, Result};
use crate::registry::{Assembly, AssemblyMember};
use crate::session::manager::SessionManager;
use crate::session::types::{CipExchange, StatusSummary};

/// Result of one assembly read.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyReadResult {
    pub status: StatusSummary,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub data_hex: String,
    /// Little-endian 16-bit view, present only when the requested size is
    /// even.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_values: Option<Vec<u16>>,
    pub timestamp: DateTime<Utc>,
}

impl AssemblyReadResult {
    fn new(status: CipStatus, data: Vec<u8>, total_size: usize) -> Self {
        // the word view is always total_size/2 long; the attribute may
        // return more or fewer bytes than the declared size
        let word_values = if total_size % 2 == 0 {
            let mut sized = data.clone();
            sized.resize(total_size, 0);
            Some(
                sized
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect(),
            )
        } else {
            None
        };
        Self {
            status: status.into(),
            data_hex: hex::encode(&data),
            data,
            word_values,
            timestamp: Utc::now(),
        }
    }
}

/// One decoded member slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberValue {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub datatype: String,
    /// Empty when the member lies past the end of the buffer.
    pub raw_hex: String,
    /// Little-endian unsigned value for 1/2/4-byte members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int_value: Option<u64>,
}

/// An assembly read decoded against its registry layout.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyRuntime {
    pub alias: String,
    pub read: AssemblyReadResult,
    pub members: Vec<MemberValue>,
}

impl SessionManager {
    /// Get_Attribute_Single (0x0E) over the Class 3 channel.
    pub async fn get_attribute_single(
        &self,
        session_id: &str,
        path: CipPath,
    ) -> Result<(CipStatus, Vec<u8>)> {
        self.exchange(
            session_id,
            CipExchange::connected(service::GET_ATTRIBUTE_SINGLE, path, Vec::new()),
        )
        .await
    }

    /// Set_Attribute_Single (0x10) over the Class 3 channel.
    pub async fn set_attribute_single(
        &self,
        session_id: &str,
        path: CipPath,
        value: Vec<u8>,
    ) -> Result<CipStatus> {
        let (status, _) = self
            .exchange(
                session_id,
                CipExchange::connected(service::SET_ATTRIBUTE_SINGLE, path, value),
            )
            .await?;
        Ok(status)
    }

    /// Read an assembly's Data attribute. A non-zero CIP status comes back
    /// inside the result, not as an error.
    pub async fn read_assembly(
        &self,
        session_id: &str,
        class_id: u16,
        instance_id: u16,
        total_size: usize,
    ) -> Result<AssemblyReadResult> {
        let (status, data) = self
            .get_attribute_single(session_id, assembly_data_path(class_id, instance_id))
            .await?;
        Ok(AssemblyReadResult::new(status, data, total_size))
    }

    /// Write an assembly by alias. The hex payload is truncated or
    /// zero-padded to the declared size when the registry knows one,
    /// otherwise sent verbatim.
    pub async fn write_assembly_by_alias(
        &self,
        session_id: &str,
        alias: &str,
        payload_hex: &str,
    ) -> Result<CipStatus> {
        let assembly = self.resolve_assembly(alias).await?;
        let mut payload = decode_hex(payload_hex)?;
        if let Some(size) = assembly.size {
            payload.resize(size, 0);
        }
        self.set_attribute_single(session_id, assembly.data_path(), payload)
            .await
    }

    /// Read an assembly by alias and decode its members per the registry
    /// layout.
    pub async fn get_assembly_runtime(
        &self,
        session_id: &str,
        alias: &str,
    ) -> Result<AssemblyRuntime> {
        let assembly = self.resolve_assembly(alias).await?;
        let (status, data) = self
            .get_attribute_single(session_id, assembly.data_path())
            .await?;
        let total_size = assembly.size.unwrap_or(data.len());
        let read = AssemblyReadResult::new(status, data, total_size);
        let members = decode_members(&assembly, &read.data);
        Ok(AssemblyRuntime {
            alias: assembly.alias,
            read,
            members,
        })
    }
}

/// Slice a flat assembly buffer into member values. Members lying past
/// the end of the buffer decode to an empty `raw_hex` and no integer
/// value rather than failing.
pub fn decode_members(assembly: &Assembly, buffer: &[u8]) -> Vec<MemberValue> {
    assembly
        .members
        .iter()
        .map(|member| decode_member(member, buffer))
        .collect()
}

fn decode_member(member: &AssemblyMember, buffer: &[u8]) -> MemberValue {
    let end = member.offset + member.size;
    let (raw_hex, int_value) = if end <= buffer.len() {
        let slice = &buffer[member.offset..end];
        let int_value = match member.size {
            1 => Some(slice[0] as u64),
            2 => Some(u16::from_le_bytes([slice[0], slice[1]]) as u64),
            4 => Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]) as u64),
            _ => None,
        };
        (hex::encode(slice), int_value)
    } else {
        (String::new(), None)
    };
    MemberValue {
        name: member.name.clone(),
        offset: member.offset,
        size: member.size,
        datatype: member.datatype.clone(),
        raw_hex,
        int_value,
    }
}

/// Apply one member's bytes onto an assembly buffer: a zero-filled
/// working copy sized to `max(current.len(), offset + size)`, with the
/// targeted bytes overwritten. The whole buffer is what goes on the wire.
pub fn patch_member(
    assembly: &Assembly,
    current: &[u8],
    member_name: &str,
    value: &[u8],
) -> Result<Vec<u8>> {
    let member = assembly
        .members
        .iter()
        .find(|member| member.name == member_name)
        .ok_or_else(|| {
            Error::config(format!(
                "assembly {:?} has no member {:?}",
                assembly.alias, member_name
            ))
        })?;
    let required = member.offset + member.size;
    let mut buffer = vec![0u8; current.len().max(required)];
    buffer[..current.len()].copy_from_slice(current);
    let mut bytes = value.to_vec();
    bytes.resize(member.size, 0);
    buffer[member.offset..required].copy_from_slice(&bytes);
    Ok(buffer)
}

fn decode_hex(payload_hex: &str) -> Result<Vec<u8>> {
    hex::decode(payload_hex.trim())
        .map_err(|e| Error::config(format!("payload is not valid hex: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::connection::Endpoint;
    use crate::registry::AssemblyRegistry;
    use crate::testsupport::FakePlc;
    use std::time::Duration;

    const DEVICE_XML: &str = r#"
        <device name="Press12">
          <assembly alias="Assembly_A" class_id="4" instance_id="100" direction="output" size="16">
            <member name="Output1" offset="0" size="1" datatype="BYTE" direction="out"/>
            <member name="Speed" offset="2" size="2" datatype="UINT" direction="out"/>
            <member name="Count" offset="4" size="4" datatype="UDINT" direction="out"/>
            <member name="Tail" offset="14" size="2" datatype="UINT" direction="out"/>
          </assembly>
        </device>
    "#;

    fn sample_assembly() -> Assembly {
        let registry = AssemblyRegistry::from_xml(DEVICE_XML).unwrap();
        registry.lookup("Assembly_A").unwrap().clone()
    }

    fn test_config(endpoint: &Endpoint) -> CoreConfig {
        CoreConfig {
            host: endpoint.host.clone(),
            port: endpoint.port,
            request_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            acquire_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            ..CoreConfig::default()
        }
    }

    #[test]
    fn test_decode_members_reports_raw_hex_and_ints() {
        let assembly = sample_assembly();
        let mut buffer = vec![0u8; 16];
        buffer[0] = 0xFF;
        buffer[2] = 0x34;
        buffer[3] = 0x12;
        buffer[4..8].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        let members = decode_members(&assembly, &buffer);

        assert_eq!(members[0].raw_hex, "ff");
        assert_eq!(members[0].int_value, Some(255));
        assert_eq!(members[1].raw_hex, "3412");
        assert_eq!(members[1].int_value, Some(0x1234));
        assert_eq!(members[2].int_value, Some(0x12345678));
    }

    #[test]
    fn test_decode_members_past_buffer_end_are_empty() {
        let assembly = sample_assembly();
        // an 8-byte read leaves the tail member out of range
        let members = decode_members(&assembly, &[0u8; 8]);
        let tail = members.iter().find(|m| m.name == "Tail").unwrap();
        assert_eq!(tail.raw_hex, "");
        assert_eq!(tail.int_value, None);
    }

    #[test]
    fn test_decode_member_of_odd_size_has_no_int() {
        let xml = r#"
            <device>
              <assembly alias="A" instance_id="1" size="4">
                <member name="Blob" offset="0" size="3"/>
              </assembly>
            </device>
        "#;
        let registry = AssemblyRegistry::from_xml(xml).unwrap();
        let members = decode_members(registry.lookup("A").unwrap(), &[1, 2, 3, 4]);
        assert_eq!(members[0].raw_hex, "010203");
        assert_eq!(members[0].int_value, None);
    }

    #[test]
    fn test_patch_member_grows_and_zero_fills() {
        let assembly = sample_assembly();
        // current buffer shorter than the member extent
        let patched = patch_member(&assembly, &[0xAA, 0xBB], "Speed", &[0x01, 0x02]).unwrap();
        assert_eq!(patched, vec![0xAA, 0xBB, 0x01, 0x02]);

        // longer current buffer is preserved outside the target bytes
        let patched = patch_member(&assembly, &[0x11; 8], "Speed", &[0xFF]).unwrap();
        assert_eq!(patched.len(), 8);
        assert_eq!(&patched[2..4], &[0xFF, 0x00]);
        assert_eq!(patched[0], 0x11);
        assert_eq!(patched[4], 0x11);
    }

    #[test]
    fn test_patch_member_unknown_name_rejected() {
        let assembly = sample_assembly();
        let err = patch_member(&assembly, &[], "Nope", &[1]).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_word_values_only_for_even_sizes() {
        let even = AssemblyReadResult::new(CipStatus::SUCCESS, vec![0x11, 0x22, 0x33, 0x44], 4);
        assert_eq!(even.word_values, Some(vec![0x2211, 0x4433]));
        let odd = AssemblyReadResult::new(CipStatus::SUCCESS, vec![0x11, 0x22, 0x33], 3);
        assert_eq!(odd.word_values, None);
    }

    #[test]
    fn test_word_view_is_sized_by_the_requested_length() {
        // a short return is zero-padded out to the requested size
        let short = AssemblyReadResult::new(CipStatus::SUCCESS, vec![0x11, 0x22], 6);
        assert_eq!(short.word_values, Some(vec![0x2211, 0x0000, 0x0000]));
        assert_eq!(short.data_hex, "1122");

        // a long return is truncated to it
        let long = AssemblyReadResult::new(
            CipStatus::SUCCESS,
            vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
            4,
        );
        assert_eq!(long.word_values, Some(vec![0x2211, 0x4433]));
        assert_eq!(long.data_hex, "112233445566");
    }

    #[tokio::test]
    async fn test_read_assembly_reports_hex_and_words() {
        let plc = FakePlc::start().await;
        plc.behavior()
            .set_attribute(4, 1, 3, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        let manager = SessionManager::new(test_config(&plc.endpoint()));
        let opened = manager.open_session(None, None).await.unwrap();

        let result = manager
            .read_assembly(&opened.session_id, 4, 1, 8)
            .await
            .unwrap();
        assert_eq!(result.status.code, 0);
        assert_eq!(result.data_hex, "1122334455667788");
        assert_eq!(
            result.word_values,
            Some(vec![0x2211, 0x4433, 0x6655, 0x8877])
        );
    }

    #[tokio::test]
    async fn test_write_by_alias_resizes_to_declared_size() {
        let plc = FakePlc::start().await;
        let manager = SessionManager::new(test_config(&plc.endpoint()));
        manager.put_configuration(DEVICE_XML).await.unwrap();
        let opened = manager.open_session(None, None).await.unwrap();

        // 17 bytes of hex truncate/pad down to the declared 16
        let status = manager
            .write_assembly_by_alias(
                &opened.session_id,
                "Assembly_A",
                "ff00000000000000000000000000000000",
            )
            .await
            .unwrap();
        assert!(status.is_success());
        let writes = plc.behavior().writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 16);
        assert_eq!(writes[0][0], 0xFF);

        // read back and decode members
        let runtime = manager
            .get_assembly_runtime(&opened.session_id, "Assembly_A")
            .await
            .unwrap();
        let output1 = runtime.members.iter().find(|m| m.name == "Output1").unwrap();
        assert_eq!(output1.raw_hex, "ff");
        assert_eq!(output1.int_value, Some(255));
    }

    #[tokio::test]
    async fn test_write_unknown_alias_reported() {
        let plc = FakePlc::start().await;
        let manager = SessionManager::new(test_config(&plc.endpoint()));
        let opened = manager.open_session(None, None).await.unwrap();
        let err = manager
            .write_assembly_by_alias(&opened.session_id, "Missing", "ff")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAlias(_)));
    }

    #[tokio::test]
    async fn test_write_bad_hex_reported() {
        let plc = FakePlc::start().await;
        let manager = SessionManager::new(test_config(&plc.endpoint()));
        manager.put_configuration(DEVICE_XML).await.unwrap();
        let opened = manager.open_session(None, None).await.unwrap();
        let err = manager
            .write_assembly_by_alias(&opened.session_id, "Assembly_A", "zz")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }
}
