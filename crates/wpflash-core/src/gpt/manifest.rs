//! XML partition manifest dialect.
//!
//! Flashing packages carry a `Partitions.xml` describing the target
//! layout. Sector numbers are 16-digit `0x` hex, GUIDs canonical
//! strings. Absent elements mean "unspecified" and are preserved as
//! such through a round-trip.

use quick_xml::{de, se};
use serde::{Deserialize, Serialize};

use crate::bytes::{format_hex_u64, parse_hex_u64};

use super::{GptError, Partition, guid_from_str, guid_to_string};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "Partitions")]
pub struct PartitionManifest {
    #[serde(rename = "Partition", default)]
    pub partitions: Vec<ManifestPartition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestPartition {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "FileSystem", default, skip_serializing_if = "Option::is_none")]
    pub file_system: Option<String>,
    #[serde(rename = "FirstSector", default, skip_serializing_if = "Option::is_none")]
    pub first_sector: Option<String>,
    #[serde(rename = "LastSector", default, skip_serializing_if = "Option::is_none")]
    pub last_sector: Option<String>,
    #[serde(
        rename = "SizeInSectors",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub size_in_sectors: Option<String>,
    #[serde(rename = "Attributes", default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<String>,
    #[serde(
        rename = "PartitionGuid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub partition_guid: Option<String>,
    #[serde(
        rename = "PartitionTypeGuid",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub partition_type_guid: Option<String>,
}

impl ManifestPartition {
    /// Convert into the in-memory model. Unspecified boundaries come
    /// back as zero with no size override; the merge logic treats a
    /// zero `first_sector` as "place me anywhere".
    pub fn to_partition(&self) -> Result<Partition, GptError> {
        let mut p = Partition::new(self.name.clone());
        if let Some(first) = &self.first_sector {
            p.set_first_sector(hex_field(first, &self.name, "FirstSector")?);
        }
        if let Some(last) = &self.last_sector {
            p.set_last_sector(hex_field(last, &self.name, "LastSector")?);
        }
        if let Some(size) = &self.size_in_sectors {
            p.set_size_in_sectors(hex_field(size, &self.name, "SizeInSectors")?);
        }
        if let Some(attrs) = &self.attributes {
            p.attributes = hex_field(attrs, &self.name, "Attributes")?;
        }
        if let Some(guid) = &self.partition_guid {
            p.partition_guid = guid_field(guid, &self.name, "PartitionGuid")?;
        }
        if let Some(guid) = &self.partition_type_guid {
            p.partition_type_guid = guid_field(guid, &self.name, "PartitionTypeGuid")?;
        }
        Ok(p)
    }

    pub fn from_partition(p: &Partition) -> Self {
        Self {
            name: p.name.clone(),
            file_system: None,
            first_sector: Some(format_hex_u64(p.first_sector())),
            last_sector: Some(format_hex_u64(p.last_sector())),
            size_in_sectors: None,
            attributes: Some(format_hex_u64(p.attributes)),
            partition_guid: Some(guid_to_string(&p.partition_guid)),
            partition_type_guid: Some(guid_to_string(&p.partition_type_guid)),
        }
    }
}

fn hex_field(value: &str, partition: &str, field: &str) -> Result<u64, GptError> {
    parse_hex_u64(value)
        .ok_or_else(|| GptError::Manifest(format!("{partition}: bad {field} value {value:?}")))
}

fn guid_field(value: &str, partition: &str, field: &str) -> Result<[u8; 16], GptError> {
    guid_from_str(value)
        .ok_or_else(|| GptError::Manifest(format!("{partition}: bad {field} value {value:?}")))
}

/// Parse a manifest document into partition models, preserving order.
pub fn parse_manifest(xml: &str) -> Result<Vec<Partition>, GptError> {
    let manifest: PartitionManifest =
        de::from_str(xml).map_err(|e| GptError::Manifest(e.to_string()))?;
    manifest.partitions.iter().map(|m| m.to_partition()).collect()
}

/// Serialize the current table back into manifest form.
pub fn write_manifest(partitions: &[Partition]) -> Result<String, GptError> {
    let manifest = PartitionManifest {
        partitions: partitions
            .iter()
            .map(ManifestPartition::from_partition)
            .collect(),
    };
    se::to_string(&manifest).map_err(|e| GptError::Manifest(e.to_string()))
}
