//! Manifest merge against a live partition table.
//!
//! A flashing package pairs a partition manifest with an archive of
//! replacement images. Merging revises the current table to match the
//! manifest while refusing any change that would strand data: a
//! partition may only move or resize when the archive carries its
//! replacement contents.

use std::io::{Read, Seek};

use tracing::{debug, warn};
use zip::ZipArchive;

use crate::bytes::round_up_to_chunk;

use super::{Gpt, GptError, Partition, new_guid};

const SECTOR_SIZE: u64 = 512;
/// Dynamic partitions land on 0x100-sector boundaries when the caller
/// asks for chunk-aligned placement (FFU chunk granularity).
const PLACEMENT_CHUNK: u64 = 0x100;

/// Source of replacement partition contents, keyed by partition name.
///
/// An entry matches a partition when its base name equals the
/// partition name or starts with `<name>.` (case-insensitive).
pub trait PartitionArchive {
    /// Size of the replacement image in whole sectors, or `None` when
    /// the archive has no entry for this partition.
    fn sectors(&mut self, name: &str) -> Option<u64>;

    /// The replacement image, zero-padded to a whole sector count.
    fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>, GptError>;
}

/// Archive backed by a ZIP file (the usual flashing-package form).
pub struct ZipPartitionArchive<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl<R: Read + Seek> ZipPartitionArchive<R> {
    pub fn new(reader: R) -> Result<Self, GptError> {
        let archive = ZipArchive::new(reader).map_err(|e| GptError::Archive(e.to_string()))?;
        Ok(Self { archive })
    }

    fn entry_name(&self, name: &str) -> Option<String> {
        let lower = name.to_ascii_lowercase();
        let prefix = format!("{lower}.");
        self.archive
            .file_names()
            .find(|n| {
                let base = n.rsplit('/').next().unwrap_or(n).to_ascii_lowercase();
                base == lower || base.starts_with(&prefix)
            })
            .map(String::from)
    }
}

impl<R: Read + Seek> PartitionArchive for ZipPartitionArchive<R> {
    fn sectors(&mut self, name: &str) -> Option<u64> {
        let entry = self.entry_name(name)?;
        let file = self.archive.by_name(&entry).ok()?;
        Some(file.size().div_ceil(SECTOR_SIZE))
    }

    fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>, GptError> {
        let Some(entry) = self.entry_name(name) else {
            return Ok(None);
        };
        let mut file = self
            .archive
            .by_name(&entry)
            .map_err(|e| GptError::Archive(e.to_string()))?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| GptError::Archive(e.to_string()))?;
        let padded = round_up_to_chunk(data.len() as u64, SECTOR_SIZE) as usize;
        data.resize(padded, 0);
        Ok(Some(data))
    }
}

/// In-memory archive, used by tests and by callers that synthesize
/// partition images on the fly.
#[derive(Default)]
pub struct MemoryArchive {
    entries: Vec<(String, Vec<u8>)>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, mut data: Vec<u8>) {
        let padded = round_up_to_chunk(data.len() as u64, SECTOR_SIZE) as usize;
        data.resize(padded, 0);
        self.entries.push((name.into(), data));
    }

    fn find(&self, name: &str) -> Option<&Vec<u8>> {
        let lower = name.to_ascii_lowercase();
        let prefix = format!("{lower}.");
        self.entries
            .iter()
            .find(|(n, _)| {
                let base = n.to_ascii_lowercase();
                base == lower || base.starts_with(&prefix)
            })
            .map(|(_, d)| d)
    }
}

impl PartitionArchive for MemoryArchive {
    fn sectors(&mut self, name: &str) -> Option<u64> {
        self.find(name).map(|d| d.len() as u64 / SECTOR_SIZE)
    }

    fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>, GptError> {
        Ok(self.find(name).cloned())
    }
}

impl Gpt {
    /// Merge a parsed manifest into the current table.
    ///
    /// Manifest partitions with a fixed `FirstSector` are placed (or
    /// verified) there; partitions backed by `archive` with no fixed
    /// location are dynamic and get appended after the highest used
    /// sector. Moving or resizing a partition the archive has no
    /// replacement data for is an error. The merge is idempotent:
    /// applying the same manifest twice leaves [`Gpt::has_changed`]
    /// clear on the second run.
    pub fn merge(
        &mut self,
        manifest: &[Partition],
        round_to_chunks: bool,
        mut archive: Option<&mut dyn PartitionArchive>,
    ) -> Result<(), GptError> {
        let mut fixed: Vec<Partition> = Vec::new();
        let mut dynamic: Vec<Partition> = Vec::new();

        for m in manifest {
            let mut p = m.clone();
            let data_sectors = archive.as_deref_mut().and_then(|a| a.sectors(&p.name));
            let size_specified = p.has_explicit_size() || p.last_sector() != 0;

            match data_sectors {
                Some(sectors) => {
                    if size_specified {
                        if p.size_in_sectors() != sectors {
                            return Err(GptError::IncorrectLength(p.name.clone()));
                        }
                    } else {
                        p.set_size_in_sectors(sectors);
                    }
                    if p.first_sector() == 0 {
                        dynamic.push(p);
                    } else {
                        fixed.push(p);
                    }
                }
                None => {
                    if p.first_sector() != 0 {
                        if let Some(cur) = self.partition(&p.name) {
                            if cur.first_sector() != p.first_sector() {
                                return Err(GptError::IncorrectLocation(p.name.clone()));
                            }
                            if size_specified && p.size_in_sectors() != cur.size_in_sectors() {
                                return Err(GptError::IncorrectLength(p.name.clone()));
                            }
                        }
                        fixed.push(p);
                    } else if let Some(cur) = self.partition(&p.name) {
                        // Metadata-only update: keep the current range.
                        let (first, last) = (cur.first_sector(), cur.last_sector());
                        p.first_sector = first;
                        p.last_sector = last;
                        p.size_override = None;
                        fixed.push(p);
                    } else {
                        // Nowhere to place it and nothing to place.
                        return Err(GptError::IncorrectLocation(p.name.clone()));
                    }
                }
            }
        }

        let mut changed = false;

        // Dynamic partitions leave the table before free space is
        // computed; they are re-appended below.
        let mut prior_dynamic: Vec<Partition> = Vec::new();
        for p in &dynamic {
            if let Some(i) = self.position(&p.name) {
                prior_dynamic.push(self.partitions.remove(i));
            }
        }

        // DPP keeps the lowest sectors on Qualcomm layouts; nothing
        // else may start at or below its end, even from underneath.
        let dpp_floor = self.partition("DPP").map(|d| d.last_sector());

        for p in &fixed {
            if let Some(dpp_last) = dpp_floor
                && !p.name.eq_ignore_ascii_case("DPP")
                && p.first_sector() <= dpp_last
            {
                return Err(GptError::IncorrectLocation(p.name.clone()));
            }
            changed |= self.place(p)?;
        }

        for mut p in dynamic {
            let mut start = self
                .partitions
                .iter()
                .map(|q| q.last_sector() + 1)
                .max()
                .unwrap_or(self.first_usable_sector)
                .max(self.first_usable_sector);
            if round_to_chunks {
                start = round_up_to_chunk(start, PLACEMENT_CHUNK);
            }
            p.set_first_sector(start);

            let prior = prior_dynamic
                .iter()
                .find(|q| q.name.eq_ignore_ascii_case(&p.name));
            if let Some(q) = prior {
                if p.partition_guid == [0; 16] {
                    p.partition_guid = q.partition_guid;
                }
                if p.partition_type_guid == [0; 16] {
                    p.partition_type_guid = q.partition_type_guid;
                }
                if p.attributes == 0 {
                    p.attributes = q.attributes;
                }
            } else if p.partition_guid == [0; 16] {
                p.partition_guid = new_guid();
            }

            debug!(name = %p.name, first = p.first_sector(), last = p.last_sector(), "Placed dynamic partition");
            let same = prior.is_some_and(|q| {
                q.first_sector() == p.first_sector()
                    && q.last_sector() == p.last_sector()
                    && q.partition_guid == p.partition_guid
                    && q.partition_type_guid == p.partition_type_guid
                    && q.attributes == p.attributes
            });
            changed |= !same;
            self.partitions.push(p);
        }

        // Every archive-backed partition must fit in front of its
        // successor (or the end of the usable area).
        if let Some(a) = archive.as_deref_mut() {
            let mut order: Vec<usize> = (0..self.partitions.len()).collect();
            order.sort_by_key(|&i| self.partitions[i].first_sector());
            for (rank, &i) in order.iter().enumerate() {
                let Some(sectors) = a.sectors(&self.partitions[i].name) else {
                    continue;
                };
                let available = match order.get(rank + 1) {
                    Some(&j) => {
                        self.partitions[j].first_sector() - self.partitions[i].first_sector()
                    }
                    None if self.last_usable_sector > 0 => {
                        self.last_usable_sector - self.partitions[i].first_sector() + 1
                    }
                    None => u64::MAX,
                };
                if sectors > available {
                    return Err(GptError::IncorrectLength(self.partitions[i].name.clone()));
                }
            }
        }

        if changed {
            self.has_changed = true;
        }
        Ok(())
    }

    /// Place one fixed-location partition: update an existing entry in
    /// place or insert a new one, then drop any other entry overlapping
    /// the revised range. Returns whether the table changed.
    fn place(&mut self, p: &Partition) -> Result<bool, GptError> {
        let mut changed = false;

        let guid_conflict = |parts: &[Partition], skip: Option<usize>| {
            p.partition_guid != [0; 16]
                && parts
                    .iter()
                    .enumerate()
                    .any(|(j, q)| Some(j) != skip && q.partition_guid == p.partition_guid)
        };

        match self.position(&p.name) {
            Some(i) => {
                let conflict = guid_conflict(&self.partitions, Some(i));
                let cur = &mut self.partitions[i];
                if cur.first_sector() != p.first_sector() || cur.last_sector() != p.last_sector() {
                    cur.first_sector = p.first_sector();
                    cur.last_sector = p.last_sector();
                    cur.size_override = None;
                    changed = true;
                }
                if p.partition_type_guid != [0; 16] && cur.partition_type_guid != p.partition_type_guid {
                    cur.partition_type_guid = p.partition_type_guid;
                    changed = true;
                }
                if p.partition_guid != [0; 16] && cur.partition_guid != p.partition_guid {
                    if conflict {
                        warn!(name = %p.name, "Partition GUID already in use, regenerating");
                        cur.partition_guid = new_guid();
                    } else {
                        cur.partition_guid = p.partition_guid;
                    }
                    changed = true;
                }
                if p.attributes != 0 && cur.attributes != p.attributes {
                    cur.attributes = p.attributes;
                    changed = true;
                }
            }
            None => {
                let mut np = p.clone();
                if np.partition_guid == [0; 16] || guid_conflict(&self.partitions, None) {
                    np.partition_guid = new_guid();
                }
                self.partitions.push(np);
                changed = true;
            }
        }

        // A moved or new partition evicts whatever its range now covers.
        let placed = self.partition(&p.name).unwrap().clone();
        let before = self.partitions.len();
        self.partitions.retain(|q| {
            q.name.eq_ignore_ascii_case(&placed.name) || !q.overlaps(&placed)
        });
        if self.partitions.len() != before {
            warn!(
                name = %placed.name,
                evicted = before - self.partitions.len(),
                "Merge evicted overlapping partitions"
            );
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::build_test_gpt;
    use super::*;

    fn manifest_entry(name: &str, first: u64, size: Option<u64>) -> Partition {
        let mut p = Partition::new(name);
        if first != 0 {
            p.set_first_sector(first);
        }
        if let Some(s) = size {
            p.set_size_in_sectors(s);
        }
        p
    }

    #[test]
    fn test_merge_is_idempotent() {
        let buffer = build_test_gpt(&[("SBL1", 0x22, 0x41), ("UEFI", 0x100, 0x1FF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();

        let mut archive = MemoryArchive::new();
        archive.insert("UEFI", vec![0xAA; 0x100 * 512]);
        let manifest = vec![manifest_entry("UEFI", 0x200, Some(0x100))];

        gpt.merge(&manifest, false, Some(&mut archive)).unwrap();
        assert!(gpt.has_changed());
        assert_eq!(gpt.partition("UEFI").unwrap().first_sector(), 0x200);

        gpt.clear_changed();
        gpt.merge(&manifest, false, Some(&mut archive)).unwrap();
        assert!(!gpt.has_changed(), "second merge must be a no-op");
    }

    #[test]
    fn test_merge_rejects_move_without_data() {
        let buffer = build_test_gpt(&[("UEFI", 0x100, 0x1FF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let manifest = vec![manifest_entry("UEFI", 0x300, Some(0x100))];
        assert!(matches!(
            gpt.merge(&manifest, false, None),
            Err(GptError::IncorrectLocation(name)) if name == "UEFI"
        ));
    }

    #[test]
    fn test_merge_rejects_size_mismatch_with_archive() {
        let buffer = build_test_gpt(&[("UEFI", 0x100, 0x1FF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let mut archive = MemoryArchive::new();
        archive.insert("UEFI", vec![0xAA; 0x80 * 512]);
        // Manifest says 0x100 sectors, archive holds 0x80.
        let manifest = vec![manifest_entry("UEFI", 0x100, Some(0x100))];
        assert!(matches!(
            gpt.merge(&manifest, false, Some(&mut archive)),
            Err(GptError::IncorrectLength(name)) if name == "UEFI"
        ));
    }

    #[test]
    fn test_merge_appends_dynamic_partition() {
        let buffer = build_test_gpt(&[("SBL1", 0x22, 0x41), ("UEFI", 0x100, 0x1FF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let mut archive = MemoryArchive::new();
        archive.insert("PLAT", vec![0xBB; 0x40 * 512]);
        let manifest = vec![manifest_entry("PLAT", 0, None)];

        gpt.merge(&manifest, true, Some(&mut archive)).unwrap();
        let plat = gpt.partition("PLAT").unwrap();
        // Appended after UEFI (ends 0x1FF), rounded up to 0x100 chunks.
        assert_eq!(plat.first_sector(), 0x200);
        assert_eq!(plat.size_in_sectors(), 0x40);
        assert_ne!(plat.partition_guid, [0u8; 16]);

        // Re-merging re-places it identically.
        gpt.clear_changed();
        gpt.merge(&manifest, true, Some(&mut archive)).unwrap();
        assert!(!gpt.has_changed());
        assert_eq!(gpt.partition("PLAT").unwrap().first_sector(), 0x200);
    }

    #[test]
    fn test_merge_evicts_overlapped_partition() {
        let buffer = build_test_gpt(&[("OLD", 0x280, 0x2FF), ("UEFI", 0x100, 0x1FF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let mut archive = MemoryArchive::new();
        archive.insert("UEFI", vec![0xAA; 0x200 * 512]);
        // UEFI grows over OLD's range.
        let manifest = vec![manifest_entry("UEFI", 0x100, Some(0x200))];

        gpt.merge(&manifest, false, Some(&mut archive)).unwrap();
        assert!(gpt.partition("OLD").is_none());
        assert_eq!(gpt.partition("UEFI").unwrap().last_sector(), 0x2FF);
    }

    #[test]
    fn test_merge_protects_dpp_region() {
        let buffer = build_test_gpt(&[("DPP", 0x22, 0xFF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let mut archive = MemoryArchive::new();
        archive.insert("X", vec![0x11; 0x10 * 512]);
        let manifest = vec![manifest_entry("X", 0x80, Some(0x10))];
        assert!(matches!(
            gpt.merge(&manifest, false, Some(&mut archive)),
            Err(GptError::IncorrectLocation(name)) if name == "X"
        ));
    }

    #[test]
    fn test_merge_rejects_partition_starting_below_dpp() {
        // DPP at 0x100..0x1FF; X starts below DPP's first sector but
        // its range would swallow DPP. The floor rule must reject it
        // before overlap eviction can remove DPP.
        let buffer = build_test_gpt(&[("DPP", 0x100, 0x1FF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let mut archive = MemoryArchive::new();
        archive.insert("X", vec![0x11; 0x100 * 512]);
        let manifest = vec![manifest_entry("X", 0x80, Some(0x100))];
        assert!(matches!(
            gpt.merge(&manifest, false, Some(&mut archive)),
            Err(GptError::IncorrectLocation(name)) if name == "X"
        ));
        assert!(gpt.partition("DPP").is_some());
    }

    #[test]
    fn test_merge_rejects_oversized_archive_entry() {
        let buffer = build_test_gpt(&[("UEFI", 0x100, 0x1FF), ("PLAT", 0x200, 0x2FF)]);
        let mut gpt = Gpt::parse(&buffer).unwrap();
        let mut archive = MemoryArchive::new();
        // 0x180 sectors of replacement data for UEFI's 0x100-sector
        // slot; the manifest leaves UEFI where it is.
        archive.insert("UEFI", vec![0xAA; 0x180 * 512]);
        let manifest = vec![manifest_entry("PLAT", 0x200, Some(0x100))];
        assert!(matches!(
            gpt.merge(&manifest, false, Some(&mut archive)),
            Err(GptError::IncorrectLength(name)) if name == "UEFI"
        ));
    }

    #[test]
    fn test_zip_archive_sizes_round_to_sectors() {
        use std::io::{Cursor, Write};
        use zip::write::{SimpleFileOptions, ZipWriter};

        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        writer
            .start_file("UEFI.bin", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&vec![0x5A; 513]).unwrap();
        writer.finish().unwrap();

        let mut archive = ZipPartitionArchive::new(Cursor::new(cursor.into_inner())).unwrap();
        assert_eq!(archive.sectors("uefi"), Some(2));
        assert_eq!(archive.sectors("PLAT"), None);
        let data = archive.read("UEFI").unwrap().unwrap();
        assert_eq!(data.len(), 1024);
        assert_eq!(data[512], 0x5A);
        assert_eq!(data[513], 0);
    }
}
