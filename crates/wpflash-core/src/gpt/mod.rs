//! GUID Partition Table model.
//!
//! Parses a GPT out of a raw sector buffer, supports in-place mutation
//! (merge against an XML manifest, the SBL1/SBL2 "HACK" carve used for
//! secure-boot bypass, backup-partition restoration) and re-serializes
//! with freshly computed CRC32 fields.

pub mod manifest;
pub mod merge;

pub use manifest::{ManifestPartition, PartitionManifest, parse_manifest, write_manifest};
pub use merge::{MemoryArchive, PartitionArchive, ZipPartitionArchive};

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::debug;

use crate::bytes::{find_ascii, read_utf16_trimmed, write_utf16_fixed};

const GPT_SIGNATURE: &[u8] = b"EFI PART";
const SECTOR_SIZE: u64 = 512;
/// Maximum encoded partition name width (UTF-16LE bytes).
const NAME_FIELD_BYTES: usize = 0x48;
/// Default rebuild buffer: one header sector plus a 128-entry table.
const DEFAULT_BUFFER_SIZE: usize = 0x4200;
/// Hardware flashing-tool limit on addressable sectors.
const FLASH_SECTOR_LIMIT: u64 = 0xF400;

/// Sentinel GUID the secure-boot hack re-tags SBL2 with.
pub const HACK_SENTINEL_GUID: [u8; 16] = [0x74; 16];

/// Primary partitions with `BACKUP_`-prefixed counterparts created
/// during unlock flashing.
const BACKUP_PAIRS: [&str; 7] = ["SBL1", "SBL2", "SBL3", "UEFI", "TZ", "RPM", "WINSECAPP"];

#[derive(Error, Debug)]
pub enum GptError {
    #[error("no \"EFI PART\" signature in buffer")]
    MissingSignature,
    #[error("partition table does not fit the buffer ({needed} > {available} bytes)")]
    TableOutOfBounds { needed: usize, available: usize },
    #[error("bad partition table: {0}")]
    BadGpt(String),
    #[error("partition {0} cannot be moved without replacement data")]
    IncorrectLocation(String),
    #[error("partition {0} size does not match its replacement data")]
    IncorrectLength(String),
    #[error("bad partition manifest: {0}")]
    Manifest(String),
    #[error("partition archive error: {0}")]
    Archive(String),
}

/// One GPT partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub partition_type_guid: [u8; 16],
    pub partition_guid: [u8; 16],
    pub attributes: u64,
    first_sector: u64,
    last_sector: u64,
    /// Explicit size override; cleared when `last_sector` is set directly.
    size_override: Option<u64>,
}

impl Partition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_type_guid: [0; 16],
            partition_guid: [0; 16],
            attributes: 0,
            first_sector: 0,
            last_sector: 0,
            size_override: None,
        }
    }

    pub fn first_sector(&self) -> u64 {
        self.first_sector
    }

    /// Moves the partition. An explicit size override follows the move.
    pub fn set_first_sector(&mut self, sector: u64) {
        self.first_sector = sector;
        if let Some(size) = self.size_override {
            self.last_sector = sector + size - 1;
        }
    }

    pub fn last_sector(&self) -> u64 {
        self.last_sector
    }

    /// Sets the end sector directly, clearing any size override.
    pub fn set_last_sector(&mut self, sector: u64) {
        self.last_sector = sector;
        self.size_override = None;
    }

    pub fn size_in_sectors(&self) -> u64 {
        self.size_override
            .unwrap_or(self.last_sector - self.first_sector + 1)
    }

    /// Sets an explicit size, shifting `last_sector` to match.
    pub fn set_size_in_sectors(&mut self, sectors: u64) {
        self.size_override = Some(sectors);
        self.last_sector = self.first_sector + sectors - 1;
    }

    pub fn has_explicit_size(&self) -> bool {
        self.size_override.is_some()
    }

    fn overlaps(&self, other: &Partition) -> bool {
        self.first_sector <= other.last_sector && other.first_sector <= self.last_sector
    }
}

/// Parsed GPT with its backing sector buffer.
#[derive(Debug, Clone)]
pub struct Gpt {
    buffer: Vec<u8>,
    header_offset: usize,
    header_size: usize,
    table_offset: usize,
    table_size: usize,
    max_partitions: u32,
    partition_entry_size: usize,
    pub first_usable_sector: u64,
    pub last_usable_sector: u64,
    pub partitions: Vec<Partition>,
    has_changed: bool,
}

impl Gpt {
    /// Parse a GPT out of a raw sector buffer. The buffer must contain
    /// the header sector and the full partition entry table.
    pub fn parse(buffer: &[u8]) -> Result<Self, GptError> {
        let header_offset =
            find_ascii(buffer, GPT_SIGNATURE).ok_or(GptError::MissingSignature)?;
        let header = &buffer[header_offset..];
        if header.len() < 0x5C {
            return Err(GptError::TableOutOfBounds {
                needed: header_offset + 0x5C,
                available: buffer.len(),
            });
        }

        let mut cursor = Cursor::new(header);
        cursor.set_position(0x0C);
        let header_size = cursor.read_u32::<LittleEndian>().map_err(io_bad_gpt)? as usize;
        cursor.set_position(0x28);
        let first_usable_sector = cursor.read_u64::<LittleEndian>().map_err(io_bad_gpt)?;
        let last_usable_sector = cursor.read_u64::<LittleEndian>().map_err(io_bad_gpt)?;
        cursor.set_position(0x50);
        let max_partitions = cursor.read_u32::<LittleEndian>().map_err(io_bad_gpt)?;
        let partition_entry_size = cursor.read_u32::<LittleEndian>().map_err(io_bad_gpt)? as usize;

        // The entry table starts in the sector after the header.
        let table_offset = header_offset + SECTOR_SIZE as usize;
        let table_size = max_partitions as usize * partition_entry_size;
        if table_offset + table_size > buffer.len() {
            return Err(GptError::TableOutOfBounds {
                needed: table_offset + table_size,
                available: buffer.len(),
            });
        }

        let mut partitions = Vec::new();
        for i in 0..max_partitions as usize {
            let entry = &buffer[table_offset + i * partition_entry_size..]
                [..partition_entry_size];
            let name = read_utf16_trimmed(&entry[0x38..0x38 + NAME_FIELD_BYTES]);
            if name.is_empty() {
                break;
            }
            let mut c = Cursor::new(&entry[0x20..0x38]);
            let first_sector = c.read_u64::<LittleEndian>().map_err(io_bad_gpt)?;
            let last_sector = c.read_u64::<LittleEndian>().map_err(io_bad_gpt)?;
            let attributes = c.read_u64::<LittleEndian>().map_err(io_bad_gpt)?;
            partitions.push(Partition {
                name,
                partition_type_guid: entry[0x00..0x10].try_into().unwrap(),
                partition_guid: entry[0x10..0x20].try_into().unwrap(),
                attributes,
                first_sector,
                last_sector,
                size_override: None,
            });
        }

        debug!(
            partitions = partitions.len(),
            first_usable = first_usable_sector,
            last_usable = last_usable_sector,
            "Parsed GPT"
        );

        Ok(Self {
            buffer: buffer.to_vec(),
            header_offset,
            header_size,
            table_offset,
            table_size,
            max_partitions,
            partition_entry_size,
            first_usable_sector,
            last_usable_sector,
            partitions,
            has_changed: false,
        })
    }

    /// Build an empty GPT (used when deserializing a manifest with no
    /// backing sector buffer).
    pub fn empty() -> Self {
        Self {
            buffer: Vec::new(),
            header_offset: 0,
            header_size: 0x5C,
            table_offset: SECTOR_SIZE as usize,
            table_size: DEFAULT_BUFFER_SIZE - SECTOR_SIZE as usize,
            max_partitions: 0x80,
            partition_entry_size: 0x80,
            first_usable_sector: 0x22,
            last_usable_sector: 0,
            partitions: Vec::new(),
            has_changed: false,
        }
    }

    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    pub fn clear_changed(&mut self) {
        self.has_changed = false;
    }

    /// Case-insensitive partition lookup.
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn partition_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.partitions
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.partitions
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Re-serialize the table and header, recomputing both CRC32 fields.
    pub fn rebuild(&mut self) -> Vec<u8> {
        if self.buffer.is_empty() {
            self.buffer = vec![0u8; DEFAULT_BUFFER_SIZE];
            self.header_offset = 0;
            self.table_offset = SECTOR_SIZE as usize;
            self.table_size = DEFAULT_BUFFER_SIZE - SECTOR_SIZE as usize;
            self.write_fresh_header();
        }

        // Entry table first.
        self.buffer[self.table_offset..self.table_offset + self.table_size].fill(0);
        for (i, p) in self.partitions.iter().enumerate() {
            let entry = &mut self.buffer[self.table_offset + i * self.partition_entry_size..]
                [..self.partition_entry_size];
            entry[0x00..0x10].copy_from_slice(&p.partition_type_guid);
            entry[0x10..0x20].copy_from_slice(&p.partition_guid);
            let mut c = Cursor::new(&mut entry[0x20..0x38]);
            c.write_u64::<LittleEndian>(p.first_sector).unwrap();
            c.write_u64::<LittleEndian>(p.last_sector).unwrap();
            c.write_u64::<LittleEndian>(p.attributes).unwrap();
            write_utf16_fixed(&mut entry[0x38..0x38 + NAME_FIELD_BYTES], &p.name);
        }

        let table_crc = crc32fast::hash(
            &self.buffer[self.table_offset..self.table_offset + self.table_size],
        );
        self.buffer[self.header_offset + 0x58..self.header_offset + 0x5C]
            .copy_from_slice(&table_crc.to_le_bytes());

        // Header CRC is computed with its own checksum field zeroed.
        self.buffer[self.header_offset + 0x10..self.header_offset + 0x14].fill(0);
        let header_crc = crc32fast::hash(
            &self.buffer[self.header_offset..self.header_offset + self.header_size],
        );
        self.buffer[self.header_offset + 0x10..self.header_offset + 0x14]
            .copy_from_slice(&header_crc.to_le_bytes());

        self.buffer.clone()
    }

    fn write_fresh_header(&mut self) {
        let h = &mut self.buffer[self.header_offset..];
        h[0..8].copy_from_slice(GPT_SIGNATURE);
        let mut c = Cursor::new(&mut h[8..]);
        c.write_u32::<LittleEndian>(0x0001_0000).unwrap(); // revision 1.0
        c.write_u32::<LittleEndian>(0x5C).unwrap(); // header size
        c.write_u32::<LittleEndian>(0).unwrap(); // checksum, filled later
        c.write_u32::<LittleEndian>(0).unwrap(); // reserved
        c.write_u64::<LittleEndian>(1).unwrap(); // current LBA
        c.write_u64::<LittleEndian>(0).unwrap(); // backup LBA
        c.write_u64::<LittleEndian>(self.first_usable_sector).unwrap();
        c.write_u64::<LittleEndian>(self.last_usable_sector).unwrap();
        c.write_u64::<LittleEndian>(0).unwrap(); // disk GUID lo
        c.write_u64::<LittleEndian>(0).unwrap(); // disk GUID hi
        c.write_u64::<LittleEndian>(2).unwrap(); // table LBA
        c.write_u32::<LittleEndian>(self.max_partitions).unwrap();
        c.write_u32::<LittleEndian>(self.partition_entry_size as u32)
            .unwrap();
    }

    /// Carve one sector off the end of SBL1 into a synthetic "HACK"
    /// partition that inherits SBL2's GUIDs, then re-tag SBL2 with the
    /// sentinel GUID. Both SBL1 and SBL2 must exist.
    pub fn insert_hack(&mut self) -> Result<(), GptError> {
        if self.partition("HACK").is_some() {
            return Ok(());
        }
        let sbl2 = self
            .partition("SBL2")
            .ok_or_else(|| GptError::BadGpt("SBL2".into()))?
            .clone();
        let sbl1 = self
            .partition_mut("SBL1")
            .ok_or_else(|| GptError::BadGpt("SBL1".into()))?;

        let carved = sbl1.last_sector;
        sbl1.set_last_sector(carved - 1);

        let mut hack = Partition::new("HACK");
        hack.first_sector = carved;
        hack.last_sector = carved;
        hack.attributes = sbl2.attributes;
        hack.partition_guid = sbl2.partition_guid;
        hack.partition_type_guid = sbl2.partition_type_guid;
        self.partitions.push(hack);

        let sbl2 = self.partition_mut("SBL2").unwrap();
        sbl2.partition_guid = HACK_SENTINEL_GUID;
        sbl2.partition_type_guid = HACK_SENTINEL_GUID;

        self.has_changed = true;
        Ok(())
    }

    /// Reverse of [`Gpt::insert_hack`].
    pub fn remove_hack(&mut self) -> Result<(), GptError> {
        let Some(hack_idx) = self.position("HACK") else {
            return Ok(());
        };
        if self.partition("SBL2").is_none() || self.partition("SBL1").is_none() {
            return Err(GptError::BadGpt("SBL2".into()));
        }
        let hack = self.partitions[hack_idx].clone();

        let sbl1 = self.partition_mut("SBL1").unwrap();
        sbl1.set_last_sector(hack.last_sector);

        let sbl2 = self.partition_mut("SBL2").unwrap();
        sbl2.partition_guid = hack.partition_guid;
        sbl2.partition_type_guid = hack.partition_type_guid;

        self.partitions.remove(hack_idx);
        self.has_changed = true;
        Ok(())
    }

    /// Swap primary/backup sector ranges wherever a prior flash left
    /// them crossed (primary starts after its backup copy).
    pub fn restore_backup_partitions(&mut self) -> Result<(), GptError> {
        let mut revised: Vec<String> = Vec::new();
        for name in BACKUP_PAIRS {
            let backup_name = format!("BACKUP_{name}");
            let (Some(pi), Some(bi)) = (self.position(name), self.position(&backup_name)) else {
                continue;
            };
            if self.partitions[pi].first_sector > self.partitions[bi].first_sector {
                let p_range = (
                    self.partitions[pi].first_sector,
                    self.partitions[pi].last_sector,
                );
                let b_range = (
                    self.partitions[bi].first_sector,
                    self.partitions[bi].last_sector,
                );
                self.partitions[pi].first_sector = b_range.0;
                self.partitions[pi].last_sector = b_range.1;
                self.partitions[bi].first_sector = p_range.0;
                self.partitions[bi].last_sector = p_range.1;
                revised.push(name.to_string());
                revised.push(backup_name);
                self.has_changed = true;
            }
        }

        for name in &revised {
            let p = self.partition(name).unwrap();
            if p.last_sector >= FLASH_SECTOR_LIMIT {
                return Err(GptError::BadGpt(name.clone()));
            }
        }
        Ok(())
    }
}

fn io_bad_gpt(e: std::io::Error) -> GptError {
    GptError::BadGpt(e.to_string())
}

/// Parse a GUID in canonical `8-4-4-4-12` form into the mixed-endian
/// 16-byte on-disk layout.
pub fn guid_from_str(s: &str) -> Option<[u8; 16]> {
    let parts: Vec<&str> = s.trim().trim_matches(['{', '}']).split('-').collect();
    if parts.len() != 5
        || parts[0].len() != 8
        || parts[1].len() != 4
        || parts[2].len() != 4
        || parts[3].len() != 4
        || parts[4].len() != 12
    {
        return None;
    }
    let d1 = u32::from_str_radix(parts[0], 16).ok()?;
    let d2 = u16::from_str_radix(parts[1], 16).ok()?;
    let d3 = u16::from_str_radix(parts[2], 16).ok()?;
    let d4 = u16::from_str_radix(parts[3], 16).ok()?;
    let d5 = u64::from_str_radix(parts[4], 16).ok()?;

    let mut g = [0u8; 16];
    g[0..4].copy_from_slice(&d1.to_le_bytes());
    g[4..6].copy_from_slice(&d2.to_le_bytes());
    g[6..8].copy_from_slice(&d3.to_le_bytes());
    g[8..10].copy_from_slice(&d4.to_be_bytes());
    g[10..16].copy_from_slice(&d5.to_be_bytes()[2..]);
    Some(g)
}

/// Format an on-disk GUID in canonical string form.
pub fn guid_to_string(g: &[u8; 16]) -> String {
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        u32::from_le_bytes(g[0..4].try_into().unwrap()),
        u16::from_le_bytes(g[4..6].try_into().unwrap()),
        u16::from_le_bytes(g[6..8].try_into().unwrap()),
        u16::from_be_bytes(g[8..10].try_into().unwrap()),
        {
            let mut b = [0u8; 8];
            b[2..].copy_from_slice(&g[10..16]);
            u64::from_be_bytes(b)
        }
    )
}

/// Generate a fresh (non-cryptographic) version-4-shaped GUID for
/// conflict resolution during merges.
pub(crate) fn new_guid() -> [u8; 16] {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut h1 = RandomState::new().build_hasher();
    h1.write_u128(nanos);
    let mut h2 = RandomState::new().build_hasher();
    h2.write_u64(h1.finish());

    let mut g = [0u8; 16];
    g[0..8].copy_from_slice(&h1.finish().to_le_bytes());
    g[8..16].copy_from_slice(&h2.finish().to_le_bytes());
    g[6] = (g[6] & 0x0F) | 0x40;
    g[8] = (g[8] & 0x3F) | 0x80;
    g
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{Gpt, Partition};

    /// Serialize a GPT buffer holding the given `(name, first, last)`
    /// partitions, with distinct synthetic GUIDs.
    pub(crate) fn build_test_gpt(parts: &[(&str, u64, u64)]) -> Vec<u8> {
        let mut gpt = Gpt::empty();
        gpt.last_usable_sector = 0x76_0000;
        for (i, &(name, first, last)) in parts.iter().enumerate() {
            let mut p = Partition::new(name);
            p.set_first_sector(first);
            p.set_last_sector(last);
            p.partition_type_guid = [i as u8 + 1; 16];
            p.partition_guid = [i as u8 + 0x81; 16];
            p.attributes = 0;
            gpt.partitions.push(p);
        }
        gpt.rebuild()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_test_gpt;
    use super::*;

    #[test]
    fn test_rebuild_reparse_structurally_equal() {
        let buffer = build_test_gpt(&[("SBL1", 0x22, 0x41), ("SBL2", 0x42, 0x61)]);
        let gpt = Gpt::parse(&buffer).unwrap();
        assert_eq!(gpt.partitions.len(), 2);
        assert_eq!(gpt.partitions[0].name, "SBL1");
        assert_eq!(gpt.partitions[0].first_sector(), 0x22);
        assert_eq!(gpt.partitions[1].last_sector(), 0x61);

        let mut gpt2 = gpt.clone();
        let rebuilt = gpt2.rebuild();
        let reparsed = Gpt::parse(&rebuilt).unwrap();
        assert_eq!(reparsed.partitions, gpt.partitions);
    }

    #[test]
    fn test_crc_fields_validate() {
        let buffer = build_test_gpt(&[("EFIESP", 0x100, 0x1FF)]);
        let gpt = Gpt::parse(&buffer).unwrap();

        // Header CRC validates with the checksum field zeroed.
        let mut header =
            buffer[gpt.header_offset..gpt.header_offset + gpt.header_size].to_vec();
        let stored = u32::from_le_bytes(header[0x10..0x14].try_into().unwrap());
        header[0x10..0x14].fill(0);
        assert_eq!(crc32fast::hash(&header), stored);

        // Table CRC validates against the raw table region.
        let table = &buffer[gpt.table_offset..gpt.table_offset + gpt.table_size];
        let stored_table =
            u32::from_le_bytes(buffer[gpt.header_offset + 0x58..gpt.header_offset + 0x5C]
                .try_into()
                .unwrap());
        assert_eq!(crc32fast::hash(table), stored_table);
    }

    #[test]
    fn test_insert_remove_hack() {
        let buffer = build_test_gpt(&[("SBL1", 0x22, 0x41), ("SBL2", 0x42, 0x61)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let sbl2_guid = gpt.partition("SBL2").unwrap().partition_guid;

        gpt.insert_hack().unwrap();
        let hack = gpt.partition("HACK").unwrap();
        assert_eq!(hack.first_sector(), 0x41);
        assert_eq!(hack.last_sector(), 0x41);
        assert_eq!(hack.partition_guid, sbl2_guid);
        assert_eq!(gpt.partition("SBL1").unwrap().last_sector(), 0x40);
        assert_eq!(
            gpt.partition("SBL2").unwrap().partition_guid,
            HACK_SENTINEL_GUID
        );

        gpt.remove_hack().unwrap();
        assert!(gpt.partition("HACK").is_none());
        assert_eq!(gpt.partition("SBL1").unwrap().last_sector(), 0x41);
        assert_eq!(gpt.partition("SBL2").unwrap().partition_guid, sbl2_guid);
    }

    #[test]
    fn test_insert_hack_requires_sbl_partitions() {
        let buffer = build_test_gpt(&[("SBL1", 0x22, 0x41)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        assert!(matches!(gpt.insert_hack(), Err(GptError::BadGpt(_))));
    }

    #[test]
    fn test_restore_backup_partitions_swaps_crossed() {
        let buffer = build_test_gpt(&[
            ("SBL1", 0x400, 0x41F),
            ("BACKUP_SBL1", 0x22, 0x41),
            ("UEFI", 0x100, 0x1FF),
        ]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        gpt.restore_backup_partitions().unwrap();
        assert_eq!(gpt.partition("SBL1").unwrap().first_sector(), 0x22);
        assert_eq!(gpt.partition("BACKUP_SBL1").unwrap().first_sector(), 0x400);
        // Untouched partition stays put.
        assert_eq!(gpt.partition("UEFI").unwrap().first_sector(), 0x100);
    }

    #[test]
    fn test_restore_backup_rejects_out_of_range() {
        let buffer = build_test_gpt(&[("SBL2", 0xF500, 0xF51F), ("BACKUP_SBL2", 0xF3F0, 0xF40F)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        // After the swap BACKUP_SBL2 ends at 0xF51F >= 0xF400.
        assert!(gpt.restore_backup_partitions().is_err());
    }

    #[test]
    fn test_guid_string_roundtrip() {
        let s = "0fc63daf-8483-4772-8e79-3d69d8477de4";
        let g = guid_from_str(s).unwrap();
        assert_eq!(guid_to_string(&g), s);
        // Mixed-endian: data1 stored little-endian.
        assert_eq!(&g[0..4], &[0xaf, 0x3d, 0xc6, 0x0f]);
    }

    #[test]
    fn test_size_override_semantics() {
        let mut p = Partition::new("DATA");
        p.set_first_sector(0x100);
        p.set_size_in_sectors(0x80);
        assert_eq!(p.last_sector(), 0x17F);
        p.set_first_sector(0x200);
        assert_eq!(p.last_sector(), 0x27F);
        p.set_last_sector(0x2FF);
        assert!(!p.has_explicit_size());
        assert_eq!(p.size_in_sectors(), 0x100);
    }
}
