//! Assembly registry
//!
//! Parses the device configuration document into an identity plus named
//! assemblies and resolves aliases onto CIP paths. Unknown elements are
//! skipped with a warning; overlapping members are preserved and reported
//! as warnings, never rejected.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::cip::assembly_data_path;
use crate::codec::CipPath;
use crate::error::{Error, Result};

/// Assembly object class used when the document does not say otherwise.
const DEFAULT_ASSEMBLY_CLASS: u16 = 0x04;
const DEFAULT_DATATYPE: &str = "BYTE";

/// Data flow direction of an assembly or member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    #[default]
    Both,
}

impl Direction {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "in" | "input" => Some(Direction::In),
            "out" | "output" => Some(Direction::Out),
            "both" => Some(Direction::Both),
            _ => None,
        }
    }
}

/// Optional identity block from the device element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// One member slice of an assembly buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyMember {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub datatype: String,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A named assembly mapped onto `(class_id, instance_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assembly {
    pub alias: String,
    pub class_id: u16,
    pub instance_id: u16,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    pub members: Vec<AssemblyMember>,
}

impl Assembly {
    /// Path of the Data attribute (attribute 3 by Assembly object
    /// convention), the target of alias reads and writes.
    pub fn data_path(&self) -> CipPath {
        assembly_data_path(self.class_id, self.instance_id)
    }
}

/// Parsed device configuration with alias lookup.
#[derive(Debug, Default)]
pub struct AssemblyRegistry {
    identity: DeviceIdentity,
    assemblies: Vec<Assembly>,
    by_alias: HashMap<String, usize>,
    raw_xml: String,
    warnings: Vec<String>,
}

impl AssemblyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse and validate a device configuration document.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut registry = Self {
            raw_xml: xml.to_string(),
            ..Self::default()
        };
        let mut current: Option<Assembly> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"device" => registry.identity = parse_identity(&e, &mut registry.warnings)?,
                    b"assembly" => {
                        if current.is_some() {
                            return Err(Error::config("nested assembly elements"));
                        }
                        current = Some(parse_assembly(&e, &mut registry.warnings)?);
                    }
                    b"member" => match current.as_mut() {
                        Some(assembly) => {
                            let member = parse_member(&e, &mut registry.warnings)?;
                            assembly.members.push(member);
                        }
                        None => {
                            registry
                                .push_warning("member element outside of an assembly, skipped");
                        }
                    },
                    other => {
                        let name = String::from_utf8_lossy(other).to_string();
                        registry.push_warning(format!("unknown element <{}>, skipped", name));
                        reader
                            .read_to_end(e.name())
                            .map_err(|err| Error::config(format!("unreadable document: {}", err)))?;
                    }
                },
                Ok(Event::Empty(e)) => match e.name().as_ref() {
                    b"device" => registry.identity = parse_identity(&e, &mut registry.warnings)?,
                    b"assembly" => {
                        let assembly = parse_assembly(&e, &mut registry.warnings)?;
                        registry.finish_assembly(assembly)?;
                    }
                    b"member" => match current.as_mut() {
                        Some(assembly) => {
                            let member = parse_member(&e, &mut registry.warnings)?;
                            assembly.members.push(member);
                        }
                        None => {
                            registry
                                .push_warning("member element outside of an assembly, skipped");
                        }
                    },
                    other => {
                        let name = String::from_utf8_lossy(other).to_string();
                        registry.push_warning(format!("unknown element <{}>, skipped", name));
                    }
                },
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"assembly" {
                        if let Some(assembly) = current.take() {
                            registry.finish_assembly(assembly)?;
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::config(format!("device document is not well-formed: {}", e)))
                }
            }
        }

        Ok(registry)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn assemblies(&self) -> &[Assembly] {
        &self.assemblies
    }

    /// Case-sensitive alias lookup.
    pub fn lookup(&self, alias: &str) -> Result<&Assembly> {
        self.by_alias
            .get(alias)
            .map(|&index| &self.assemblies[index])
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))
    }

    /// Warnings collected while parsing (unknown elements, overlaps).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The document as last accepted.
    pub fn raw_xml(&self) -> &str {
        &self.raw_xml
    }

    fn finish_assembly(&mut self, assembly: Assembly) -> Result<()> {
        if self.by_alias.contains_key(&assembly.alias) {
            return Err(Error::config(format!(
                "duplicate assembly alias {:?}",
                assembly.alias
            )));
        }
        if let Some(size) = assembly.size {
            for member in &assembly.members {
                if member.offset + member.size > size {
                    return Err(Error::config(format!(
                        "member {:?} spans [{}, {}) past the {}-byte assembly {:?}",
                        member.name,
                        member.offset,
                        member.offset + member.size,
                        size,
                        assembly.alias
                    )));
                }
            }
        }
        // overlap is a diagnostic, never a rejection; overlapping members
        // are preserved
        let mut spans: Vec<(usize, usize, &str)> = assembly
            .members
            .iter()
            .map(|m| (m.offset, m.offset + m.size, m.name.as_str()))
            .collect();
        spans.sort();
        let mut overlap_warnings = Vec::new();
        for pair in spans.windows(2) {
            if pair[1].0 < pair[0].1 {
                overlap_warnings.push(format!(
                    "members {:?} and {:?} overlap in assembly {:?}",
                    pair[0].2, pair[1].2, assembly.alias
                ));
            }
        }
        for warning in overlap_warnings {
            self.push_warning(warning);
        }

        self.by_alias
            .insert(assembly.alias.clone(), self.assemblies.len());
        self.assemblies.push(assembly);
        Ok(())
    }

    fn push_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        warn!("device configuration: {}", warning);
        self.warnings.push(warning);
    }
}

fn attributes(
    element: &BytesStart<'_>,
    known: &[&str],
    warnings: &mut Vec<String>,
) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attribute in element.attributes() {
        let attribute =
            attribute.map_err(|e| Error::config(format!("unreadable attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).to_string();
        let value = attribute
            .unescape_value()
            .map_err(|e| Error::config(format!("unreadable attribute value: {}", e)))?
            .to_string();
        if known.contains(&key.as_str()) {
            map.insert(key, value);
        } else {
            let element_name = String::from_utf8_lossy(element.name().as_ref()).to_string();
            let warning = format!("unknown attribute {:?} on <{}>, skipped", key, element_name);
            warn!("device configuration: {}", warning);
            warnings.push(warning);
        }
    }
    Ok(map)
}

fn parse_identity(
    element: &BytesStart<'_>,
    warnings: &mut Vec<String>,
) -> Result<DeviceIdentity> {
    let mut attrs = attributes(
        element,
        &["name", "vendor", "product_code", "revision", "serial_number"],
        warnings,
    )?;
    Ok(DeviceIdentity {
        name: attrs.remove("name"),
        vendor: attrs.remove("vendor"),
        product_code: attrs.remove("product_code"),
        revision: attrs.remove("revision"),
        serial_number: attrs.remove("serial_number"),
    })
}

fn parse_assembly(element: &BytesStart<'_>, warnings: &mut Vec<String>) -> Result<Assembly> {
    let mut attrs = attributes(
        element,
        &["alias", "class_id", "instance_id", "direction", "size"],
        warnings,
    )?;
    let alias = attrs
        .remove("alias")
        .filter(|alias| !alias.is_empty())
        .ok_or_else(|| Error::config("assembly without an alias"))?;
    let class_id = match attrs.remove("class_id") {
        Some(raw) => parse_number::<u16>("class_id", &raw)?,
        None => DEFAULT_ASSEMBLY_CLASS,
    };
    let instance_id = attrs
        .remove("instance_id")
        .ok_or_else(|| Error::config(format!("assembly {:?} without an instance_id", alias)))
        .and_then(|raw| parse_number::<u16>("instance_id", &raw))?;
    let direction = parse_direction(attrs.remove("direction"), &alias)?;
    let size = attrs
        .remove("size")
        .map(|raw| parse_number::<usize>("size", &raw))
        .transpose()?;
    Ok(Assembly {
        alias,
        class_id,
        instance_id,
        direction,
        size,
        members: Vec::new(),
    })
}

fn parse_member(element: &BytesStart<'_>, warnings: &mut Vec<String>) -> Result<AssemblyMember> {
    let mut attrs = attributes(
        element,
        &["name", "offset", "size", "datatype", "direction", "description"],
        warnings,
    )?;
    let name = attrs
        .remove("name")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::config("member without a name"))?;
    let offset = attrs
        .remove("offset")
        .ok_or_else(|| Error::config(format!("member {:?} without an offset", name)))
        .and_then(|raw| parse_number::<usize>("offset", &raw))?;
    let size = attrs
        .remove("size")
        .ok_or_else(|| Error::config(format!("member {:?} without a size", name)))
        .and_then(|raw| parse_number::<usize>("size", &raw))?;
    let datatype = attrs
        .remove("datatype")
        .unwrap_or_else(|| DEFAULT_DATATYPE.to_string());
    let direction = parse_direction(attrs.remove("direction"), &name)?;
    Ok(AssemblyMember {
        name,
        offset,
        size,
        datatype,
        direction,
        description: attrs.remove("description"),
    })
}

fn parse_direction(raw: Option<String>, owner: &str) -> Result<Direction> {
    match raw {
        None => Ok(Direction::Both),
        Some(raw) => Direction::parse(&raw).ok_or_else(|| {
            Error::config(format!("invalid direction {:?} on {:?}", raw, owner))
        }),
    }
}

/// Parse a decimal or `0x`-prefixed number.
fn parse_number<T>(field: &str, raw: &str) -> Result<T>
where
    T: TryFrom<u64>,
{
    let raw = raw.trim();
    let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        raw.parse::<u64>()
    };
    parsed
        .ok()
        .and_then(|value| T::try_from(value).ok())
        .ok_or_else(|| Error::config(format!("{} value {:?} is not a valid number", field, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <device name="Press12" vendor="Acme" product_code="77" revision="2.1" serial_number="00012345">
          <assembly alias="Assembly_A" class_id="4" instance_id="100" direction="output" size="16">
            <member name="Output1" offset="0" size="1" datatype="BYTE" direction="out" description="main contactor"/>
            <member name="Setpoint" offset="2" size="2" datatype="UINT" direction="out"/>
          </assembly>
          <assembly alias="Status" instance_id="0x65" direction="input" size="8">
            <member name="State" offset="0" size="4" datatype="UDINT" direction="in"/>
          </assembly>
        </device>
    "#;

    #[test]
    fn test_parse_sample_document() {
        let registry = AssemblyRegistry::from_xml(SAMPLE).unwrap();
        assert_eq!(registry.identity().name.as_deref(), Some("Press12"));
        assert_eq!(registry.assemblies().len(), 2);
        assert!(registry.warnings().is_empty());

        let assembly = registry.lookup("Assembly_A").unwrap();
        assert_eq!(assembly.class_id, 4);
        assert_eq!(assembly.instance_id, 100);
        assert_eq!(assembly.size, Some(16));
        assert_eq!(assembly.members.len(), 2);
        assert_eq!(assembly.members[0].name, "Output1");
        assert_eq!(assembly.members[0].direction, Direction::Out);

        // hex instance id and defaulted class id
        let status = registry.lookup("Status").unwrap();
        assert_eq!(status.class_id, 4);
        assert_eq!(status.instance_id, 0x65);
    }

    #[test]
    fn test_alias_lookup_is_case_sensitive() {
        let registry = AssemblyRegistry::from_xml(SAMPLE).unwrap();
        assert!(registry.lookup("Assembly_A").is_ok());
        let err = registry.lookup("assembly_a").unwrap_err();
        assert!(matches!(err, Error::UnknownAlias(_)));
    }

    #[test]
    fn test_duplicate_alias_rejected() {
        let xml = r#"
            <device>
              <assembly alias="A" instance_id="1" size="4"/>
              <assembly alias="A" instance_id="2" size="4"/>
            </device>
        "#;
        let err = AssemblyRegistry::from_xml(xml).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_member_past_declared_size_rejected() {
        let xml = r#"
            <device>
              <assembly alias="A" instance_id="1" size="4">
                <member name="M" offset="3" size="2"/>
              </assembly>
            </device>
        "#;
        let err = AssemblyRegistry::from_xml(xml).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_overlapping_members_preserved_with_warning() {
        let xml = r#"
            <device>
              <assembly alias="A" instance_id="1" size="8">
                <member name="Word" offset="0" size="2"/>
                <member name="LowByte" offset="0" size="1"/>
              </assembly>
            </device>
        "#;
        let registry = AssemblyRegistry::from_xml(xml).unwrap();
        let assembly = registry.lookup("A").unwrap();
        assert_eq!(assembly.members.len(), 2);
        assert!(registry
            .warnings()
            .iter()
            .any(|warning| warning.contains("overlap")));
    }

    #[test]
    fn test_unknown_elements_and_attributes_warn_but_parse() {
        let xml = r#"
            <device name="X">
              <firmware version="9"/>
              <assembly alias="A" instance_id="1" size="2" color="red">
                <member name="M" offset="0" size="2"/>
              </assembly>
            </device>
        "#;
        let registry = AssemblyRegistry::from_xml(xml).unwrap();
        assert!(registry.lookup("A").is_ok());
        assert!(registry.warnings().iter().any(|w| w.contains("firmware")));
        assert!(registry.warnings().iter().any(|w| w.contains("color")));
    }

    #[test]
    fn test_bad_number_rejected() {
        let xml = r#"<device><assembly alias="A" instance_id="lots"/></device>"#;
        let err = AssemblyRegistry::from_xml(xml).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_missing_instance_id_rejected() {
        let xml = r#"<device><assembly alias="A" size="4"/></device>"#;
        assert!(AssemblyRegistry::from_xml(xml).is_err());
    }

    #[test]
    fn test_malformed_document_rejected() {
        let err = AssemblyRegistry::from_xml("<device><assembly").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn test_data_path_targets_attribute_three() {
        let registry = AssemblyRegistry::from_xml(SAMPLE).unwrap();
        let path = registry.lookup("Assembly_A").unwrap().data_path();
        assert_eq!(path.encode().unwrap(), vec![0x20, 0x04, 0x24, 0x64, 0x30, 0x03]);
    }

    #[test]
    fn test_raw_xml_round_trips() {
        let registry = AssemblyRegistry::from_xml(SAMPLE).unwrap();
        assert_eq!(registry.raw_xml(), SAMPLE);
    }
}
