//! FFU (Full Flash Update) image model.
//!
//! An FFU is a chunk-oriented sparse disk image: three chunk-aligned
//! header regions (security, image, store) followed by payload chunks.
//! The store header's write descriptors map payload chunks to logical
//! disk locations; logical ranges with no descriptor read as zeros.
//! Sector reads go through the chunk map, so callers address the
//! virtual disk without caring about the sparse layout.

mod shared;

pub use shared::{FileScope, SharedFile};

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::Compression;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, info};

use crate::bytes::{read_ascii_trimmed, round_up_to_chunk};
use crate::events::{FlashEvent, FlashObserver};
use crate::gpt::{Gpt, GptError};

const SECTOR_SIZE: u64 = 512;
const SECURITY_SIGNATURE: &[u8; 12] = b"SignedImage ";
const IMAGE_SIGNATURE: &[u8; 11] = b"ImageFlash ";
/// Fixed store header prefix size; descriptor tables follow.
const STORE_HEADER_SIZE: usize = 248;
/// GPT region read on demand: protective MBR + header + entry table.
const GPT_SECTOR_COUNT: u64 = 34;
/// Blocks queued between the read loop and the compression worker.
const COMPRESS_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum FfuError {
    #[error("bad FFU format in {path}: {reason}")]
    BadImageFormat { path: PathBuf, reason: String },
    #[error("size mismatch in {path}: headers + payload = {computed} bytes, file is {actual}")]
    SizeMismatch {
        path: PathBuf,
        computed: u64,
        actual: u64,
    },
    #[error("partition not found: {0}")]
    PartitionNotFound(String),
    #[error(transparent)]
    Gpt(#[from] GptError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed FFU image. Holds the chunk map in memory; payload stays on
/// disk and is read through a [`SharedFile`] scope per operation.
#[derive(Debug)]
pub struct FfuImage {
    file: SharedFile,
    chunk_size: u32,
    header_size: u64,
    payload_size: u64,
    total_chunk_count: u32,
    platform_id: String,
    manifest: String,
    /// Logical chunk index -> payload chunk index.
    chunk_map: Vec<Option<u32>>,
}

impl FfuImage {
    /// Open and validate an FFU file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FfuError> {
        let path = path.into();
        let file = SharedFile::new(&path);
        let scope = file.open_scope()?;
        let actual_size = std::fs::metadata(&path)?.len();

        let bad = |reason: &str| FfuError::BadImageFormat {
            path: path.clone(),
            reason: reason.to_string(),
        };

        // Security header.
        let mut short = [0u8; 0x20];
        scope.read_exact_at(0, &mut short)?;
        if &short[0x04..0x10] != SECURITY_SIGNATURE {
            return Err(bad("missing SignedImage signature"));
        }
        let mut c = Cursor::new(&short[..]);
        let security_header_size = c.read_u32::<LittleEndian>()? as u64;
        c.set_position(0x10);
        let chunk_size_kb = c.read_u32::<LittleEndian>()?;
        let _hash_algorithm = c.read_u32::<LittleEndian>()?;
        let catalog_size = c.read_u32::<LittleEndian>()? as u64;
        let hash_table_size = c.read_u32::<LittleEndian>()? as u64;

        let chunk_size = chunk_size_kb.saturating_mul(1024);
        if chunk_size == 0 || chunk_size as u64 % SECTOR_SIZE != 0 {
            return Err(bad("unusable chunk size"));
        }
        let chunk = chunk_size as u64;
        let security_region =
            round_up_to_chunk(security_header_size + catalog_size + hash_table_size, chunk);

        // Image header.
        let mut short = [0u8; 0x18];
        scope.read_exact_at(security_region, &mut short)?;
        if &short[0x04..0x0F] != IMAGE_SIGNATURE {
            return Err(bad("missing ImageFlash signature"));
        }
        let mut c = Cursor::new(&short[..]);
        let image_header_size = c.read_u32::<LittleEndian>()? as u64;
        c.set_position(0x10);
        let manifest_length = c.read_u32::<LittleEndian>()? as u64;
        let image_region = round_up_to_chunk(image_header_size + manifest_length, chunk);

        let mut manifest_raw = vec![0u8; manifest_length as usize];
        scope.read_exact_at(security_region + image_header_size, &mut manifest_raw)?;
        let manifest = String::from_utf8_lossy(&manifest_raw).into_owned();

        // Store header with its descriptor tables.
        let store_offset = security_region + image_region;
        let mut store = [0u8; STORE_HEADER_SIZE];
        scope.read_exact_at(store_offset, &mut store)?;
        let platform_id = read_ascii_trimmed(&store[0x0C..0x0C + 192]);
        let mut c = Cursor::new(&store[0xCC..]);
        let block_size = c.read_u32::<LittleEndian>()?;
        let write_descriptor_count = c.read_u32::<LittleEndian>()?;
        let write_descriptor_length = c.read_u32::<LittleEndian>()? as u64;
        let _validate_descriptor_count = c.read_u32::<LittleEndian>()?;
        let validate_descriptor_length = c.read_u32::<LittleEndian>()? as u64;

        if block_size != chunk_size {
            return Err(bad("store block size disagrees with security header"));
        }
        let store_region = round_up_to_chunk(
            STORE_HEADER_SIZE as u64 + validate_descriptor_length + write_descriptor_length,
            chunk,
        );

        let mut descriptors = vec![0u8; write_descriptor_length as usize];
        scope.read_exact_at(
            store_offset + STORE_HEADER_SIZE as u64 + validate_descriptor_length,
            &mut descriptors,
        )?;

        let (chunk_map, total_chunk_count) =
            Self::build_chunk_map(&descriptors, write_descriptor_count)
                .map_err(|reason| bad(&reason))?;

        let header_size = security_region + image_region + store_region;
        let payload_size = total_chunk_count as u64 * chunk;
        let computed = header_size + payload_size;
        if computed != actual_size {
            return Err(FfuError::SizeMismatch {
                path,
                computed,
                actual: actual_size,
            });
        }

        drop(scope);
        info!(
            path = %file.path().display(),
            platform = %platform_id,
            chunk_size,
            chunks = total_chunk_count,
            "Opened FFU image"
        );

        Ok(Self {
            file,
            chunk_size,
            header_size,
            payload_size,
            total_chunk_count,
            platform_id,
            manifest,
            chunk_map,
        })
    }

    /// Walk the write descriptors into a logical -> payload chunk map.
    ///
    /// Access method 0 targets the main disk from its start; method 2
    /// counts from the disk end and is skipped here, but its payload
    /// chunks still advance the physical cursor.
    fn build_chunk_map(
        descriptors: &[u8],
        count: u32,
    ) -> Result<(Vec<Option<u32>>, u32), String> {
        let mut c = Cursor::new(descriptors);
        let mut map: Vec<Option<u32>> = Vec::new();
        let mut physical: u32 = 0;

        for _ in 0..count {
            let location_count = c
                .read_u32::<LittleEndian>()
                .map_err(|_| "truncated write descriptor table".to_string())?;
            let chunk_count = c
                .read_u32::<LittleEndian>()
                .map_err(|_| "truncated write descriptor table".to_string())?;
            for _ in 0..location_count {
                let access_method = c
                    .read_u32::<LittleEndian>()
                    .map_err(|_| "truncated disk location".to_string())?;
                let chunk_index = c
                    .read_u32::<LittleEndian>()
                    .map_err(|_| "truncated disk location".to_string())?;
                if access_method == 0 {
                    let end = chunk_index as usize + chunk_count as usize;
                    if map.len() < end {
                        map.resize(end, None);
                    }
                    for j in 0..chunk_count {
                        map[chunk_index as usize + j as usize] = Some(physical + j);
                    }
                }
            }
            physical = physical
                .checked_add(chunk_count)
                .ok_or_else(|| "payload chunk count overflow".to_string())?;
        }
        debug!(logical = map.len(), physical, "Built FFU chunk map");
        Ok((map, physical))
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    pub fn total_chunk_count(&self) -> u32 {
        self.total_chunk_count
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The combined header region (security + image + store), exactly
    /// as stored. Flash protocols send this ahead of the payload.
    pub fn header_blob(&self) -> Result<Vec<u8>, FfuError> {
        let scope = self.file.open_scope()?;
        let mut blob = vec![0u8; self.header_size as usize];
        scope.read_exact_at(0, &mut blob)?;
        Ok(blob)
    }

    /// One payload chunk by physical index, for sequential flashing.
    pub fn payload_chunk(&self, index: u32) -> Result<Vec<u8>, FfuError> {
        let scope = self.file.open_scope()?;
        let mut chunk = vec![0u8; self.chunk_size as usize];
        scope.read_exact_at(
            self.header_size + index as u64 * self.chunk_size as u64,
            &mut chunk,
        )?;
        Ok(chunk)
    }

    /// Read `count` sectors of the virtual disk starting at `start`.
    /// Unmapped ranges come back zeroed.
    pub fn get_sectors(&self, start: u64, count: u64) -> Result<Vec<u8>, FfuError> {
        let mut out = vec![0u8; (count * SECTOR_SIZE) as usize];
        if count == 0 {
            return Ok(out);
        }
        let spc = self.chunk_size as u64 / SECTOR_SIZE;
        let scope = self.file.open_scope()?;

        for chunk in start / spc..=(start + count - 1) / spc {
            let Some(physical) = self.chunk_map.get(chunk as usize).copied().flatten() else {
                continue;
            };
            let chunk_first = chunk * spc;
            let lo = start.max(chunk_first);
            let hi = (start + count).min(chunk_first + spc);
            let out_off = ((lo - start) * SECTOR_SIZE) as usize;
            let len = ((hi - lo) * SECTOR_SIZE) as usize;
            let src = self.header_size
                + physical as u64 * self.chunk_size as u64
                + (lo - chunk_first) * SECTOR_SIZE;
            scope.read_exact_at(src, &mut out[out_off..out_off + len])?;
        }
        Ok(out)
    }

    /// Parse the partition table out of the virtual disk.
    pub fn gpt(&self) -> Result<Gpt, FfuError> {
        let sectors = self.get_sectors(0, GPT_SECTOR_COUNT)?;
        Ok(Gpt::parse(&sectors)?)
    }

    /// Whole contents of a named partition.
    pub fn get_partition(&self, name: &str) -> Result<Vec<u8>, FfuError> {
        let gpt = self.gpt()?;
        let p = gpt
            .partition(name)
            .ok_or_else(|| FfuError::PartitionNotFound(name.to_string()))?;
        self.get_sectors(p.first_sector(), p.size_in_sectors())
    }

    /// Whether the image actually carries data for a partition (its
    /// first sector's chunk is mapped). Sparse images list partitions
    /// in the GPT without shipping their contents.
    pub fn is_partition_present(&self, name: &str) -> Result<bool, FfuError> {
        let gpt = self.gpt()?;
        let Some(p) = gpt.partition(name) else {
            return Ok(false);
        };
        let spc = self.chunk_size as u64 / SECTOR_SIZE;
        let chunk = (p.first_sector() / spc) as usize;
        Ok(self.chunk_map.get(chunk).copied().flatten().is_some())
    }

    /// Stream a partition into `sink`, optionally gzip-compressed.
    ///
    /// Compression runs on a dedicated worker so disk reads overlap
    /// the deflate work; the queue between them is bounded.
    pub fn write_partition<W: Write + Send>(
        &self,
        name: &str,
        sink: &mut W,
        observer: &dyn FlashObserver,
        compress: bool,
    ) -> Result<(), FfuError> {
        let gpt = self.gpt()?;
        let p = gpt
            .partition(name)
            .ok_or_else(|| FfuError::PartitionNotFound(name.to_string()))?;
        let (first, total) = (p.first_sector(), p.size_in_sectors());
        let spc = self.chunk_size as u64 / SECTOR_SIZE;

        if !compress {
            let mut done = 0u64;
            while done < total {
                let n = spc.min(total - done);
                sink.write_all(&self.get_sectors(first + done, n)?)?;
                done += n;
                observer.on_event(&FlashEvent::Progress {
                    operation: name.to_string(),
                    current: done,
                    total,
                });
            }
            return Ok(());
        }

        std::thread::scope(|s| -> Result<(), FfuError> {
            let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(COMPRESS_QUEUE_DEPTH);
            let worker = s.spawn(move || -> Result<(), FfuError> {
                let mut encoder = GzEncoder::new(sink, Compression::default());
                for block in rx {
                    encoder.write_all(&block)?;
                }
                encoder.finish()?;
                Ok(())
            });

            let mut done = 0u64;
            while done < total {
                let n = spc.min(total - done);
                let block = self.get_sectors(first + done, n)?;
                if tx.send(block).is_err() {
                    break; // worker failed; its error surfaces below
                }
                done += n;
                observer.on_event(&FlashEvent::Progress {
                    operation: name.to_string(),
                    current: done,
                    total,
                });
            }
            drop(tx);
            match worker.join() {
                Ok(result) => result,
                Err(_) => Err(FfuError::Io(std::io::Error::other(
                    "compression worker panicked",
                ))),
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::io::Write;

    use crate::bytes::round_up_to_chunk;

    pub const TEST_CHUNK: usize = 0x1000;

    /// Serialize a minimal FFU: 4KB chunks, zero-length catalog and
    /// hash table, given write descriptors and payload chunks.
    ///
    /// `descriptors` entries are `(chunk_count, locations)` with each
    /// location `(access_method, chunk_index)`.
    pub fn build_ffu(
        descriptors: &[(u32, Vec<(u32, u32)>)],
        payload_chunks: &[Vec<u8>],
        manifest: &str,
    ) -> Vec<u8> {
        let chunk = TEST_CHUNK as u64;

        let mut security = vec![0u8; TEST_CHUNK];
        security[0x00..0x04].copy_from_slice(&0x20u32.to_le_bytes());
        security[0x04..0x10].copy_from_slice(b"SignedImage ");
        security[0x10..0x14].copy_from_slice(&4u32.to_le_bytes()); // chunk KB
        security[0x14..0x18].copy_from_slice(&0x800Cu32.to_le_bytes());

        let mut image = vec![0u8; TEST_CHUNK];
        image[0x00..0x04].copy_from_slice(&0x18u32.to_le_bytes());
        image[0x04..0x0F].copy_from_slice(b"ImageFlash ");
        image[0x10..0x14].copy_from_slice(&(manifest.len() as u32).to_le_bytes());
        image[0x14..0x18].copy_from_slice(&4u32.to_le_bytes());
        image[0x18..0x18 + manifest.len()].copy_from_slice(manifest.as_bytes());

        let mut table = Vec::new();
        for (chunk_count, locations) in descriptors {
            table.extend_from_slice(&(locations.len() as u32).to_le_bytes());
            table.extend_from_slice(&chunk_count.to_le_bytes());
            for (method, index) in locations {
                table.extend_from_slice(&method.to_le_bytes());
                table.extend_from_slice(&index.to_le_bytes());
            }
        }

        let store_region =
            round_up_to_chunk(248 + table.len() as u64, chunk) as usize;
        let mut store = vec![0u8; store_region];
        store[0x0C..0x0C + 13].copy_from_slice(b"Test.Platform");
        store[0xCC..0xD0].copy_from_slice(&(TEST_CHUNK as u32).to_le_bytes());
        store[0xD0..0xD4].copy_from_slice(&(descriptors.len() as u32).to_le_bytes());
        store[0xD4..0xD8].copy_from_slice(&(table.len() as u32).to_le_bytes());
        // validate descriptors: none
        store[0xF8..0xF8 + table.len()].copy_from_slice(&table);

        let mut out = Vec::new();
        out.write_all(&security).unwrap();
        out.write_all(&image).unwrap();
        out.write_all(&store).unwrap();
        for c in payload_chunks {
            assert_eq!(c.len(), TEST_CHUNK);
            out.write_all(c).unwrap();
        }
        out
    }

    /// An FFU whose first five logical chunks hold a GPT naming UEFI
    /// (backed by payload) and PLAT (listed but unmapped).
    pub fn build_ffu_with_gpt() -> Vec<u8> {
        let gpt_bytes = crate::gpt::testutil::build_test_gpt(&[
            ("UEFI", 0x28, 0x2F),
            ("PLAT", 0x30, 0x37),
        ]);

        let mut chunks: Vec<Vec<u8>> = Vec::new();
        for i in 0..5 {
            let mut c = vec![0u8; TEST_CHUNK];
            let lo = i * TEST_CHUNK;
            let hi = ((i + 1) * TEST_CHUNK).min(gpt_bytes.len());
            if lo < gpt_bytes.len() {
                c[..hi - lo].copy_from_slice(&gpt_bytes[lo..hi]);
            }
            chunks.push(c);
        }
        chunks.push(vec![0xAB; TEST_CHUNK]); // UEFI contents

        build_ffu(
            &[(5, vec![(0, 0)]), (1, vec![(0, 5)])],
            &chunks,
            "[Image]\n",
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::testutil::{TEST_CHUNK, build_ffu, build_ffu_with_gpt};
    use super::*;
    use crate::events::NullObserver;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        tmp
    }

    fn sparse_image() -> Vec<u8> {
        // Logical 0..1 <- payload 0..1, one skipped (from-end) chunk
        // consuming payload 2, logical 4 <- payload 3.
        let chunks = vec![
            vec![0x10; TEST_CHUNK],
            vec![0x20; TEST_CHUNK],
            vec![0x30; TEST_CHUNK],
            vec![0x40; TEST_CHUNK],
        ];
        build_ffu(
            &[
                (2, vec![(0, 0)]),
                (1, vec![(2, 0)]),
                (1, vec![(0, 4)]),
            ],
            &chunks,
            "[Image]\n",
        )
    }

    #[test]
    fn test_open_parses_headers() {
        let tmp = write_temp(&sparse_image());
        let ffu = FfuImage::open(tmp.path()).unwrap();
        assert_eq!(ffu.platform_id(), "Test.Platform");
        assert_eq!(ffu.chunk_size(), TEST_CHUNK as u32);
        assert_eq!(ffu.header_size(), 3 * TEST_CHUNK as u64);
        assert_eq!(ffu.total_chunk_count(), 4);
        assert_eq!(ffu.payload_size(), 4 * TEST_CHUNK as u64);
        assert_eq!(ffu.manifest(), "[Image]\n");
    }

    #[test]
    fn test_open_rejects_bad_signature() {
        let mut image = sparse_image();
        image[4] = b'X';
        let tmp = write_temp(&image);
        assert!(matches!(
            FfuImage::open(tmp.path()),
            Err(FfuError::BadImageFormat { .. })
        ));
    }

    #[test]
    fn test_open_rejects_truncated_payload() {
        let mut image = sparse_image();
        image.truncate(image.len() - TEST_CHUNK);
        let tmp = write_temp(&image);
        assert!(matches!(
            FfuImage::open(tmp.path()),
            Err(FfuError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_sparse_reads_and_skipped_chunk_consumption() {
        let tmp = write_temp(&sparse_image());
        let ffu = FfuImage::open(tmp.path()).unwrap();
        let spc = TEST_CHUNK as u64 / 512;

        // Mapped chunks read back their payload.
        assert!(ffu.get_sectors(0, 1).unwrap().iter().all(|&b| b == 0x10));
        assert!(ffu.get_sectors(spc, 1).unwrap().iter().all(|&b| b == 0x20));
        // Unmapped logical chunks are zero.
        assert!(ffu.get_sectors(2 * spc, spc).unwrap().iter().all(|&b| b == 0));
        // The from-end descriptor consumed payload chunk 2, so logical
        // chunk 4 maps to payload chunk 3.
        assert!(ffu.get_sectors(4 * spc, 1).unwrap().iter().all(|&b| b == 0x40));
    }

    #[test]
    fn test_read_spanning_chunk_boundary() {
        let tmp = write_temp(&sparse_image());
        let ffu = FfuImage::open(tmp.path()).unwrap();
        let spc = TEST_CHUNK as u64 / 512;
        let data = ffu.get_sectors(spc - 1, 2).unwrap();
        assert!(data[..512].iter().all(|&b| b == 0x10));
        assert!(data[512..].iter().all(|&b| b == 0x20));
    }

    #[test]
    fn test_partition_access_through_gpt() {
        let tmp = write_temp(&build_ffu_with_gpt());
        let ffu = FfuImage::open(tmp.path()).unwrap();

        let gpt = ffu.gpt().unwrap();
        assert!(gpt.partition("UEFI").is_some());

        assert!(ffu.is_partition_present("UEFI").unwrap());
        assert!(!ffu.is_partition_present("PLAT").unwrap());
        assert!(!ffu.is_partition_present("NOPE").unwrap());

        let uefi = ffu.get_partition("UEFI").unwrap();
        assert_eq!(uefi.len(), 8 * 512);
        assert!(uefi.iter().all(|&b| b == 0xAB));

        // Listed but sparse: contents read as zeros.
        let plat = ffu.get_partition("PLAT").unwrap();
        assert!(plat.iter().all(|&b| b == 0));

        assert!(matches!(
            ffu.get_partition("NOPE"),
            Err(FfuError::PartitionNotFound(_))
        ));
    }

    #[test]
    fn test_write_partition_plain_and_compressed() {
        let tmp = write_temp(&build_ffu_with_gpt());
        let ffu = FfuImage::open(tmp.path()).unwrap();

        let mut plain = Vec::new();
        ffu.write_partition("UEFI", &mut plain, &NullObserver, false)
            .unwrap();
        assert_eq!(plain, ffu.get_partition("UEFI").unwrap());

        let mut packed = Vec::new();
        ffu.write_partition("UEFI", &mut packed, &NullObserver, true)
            .unwrap();
        let mut unpacked = Vec::new();
        flate2::read::GzDecoder::new(&packed[..])
            .read_to_end(&mut unpacked)
            .unwrap();
        assert_eq!(unpacked, plain);
    }

    #[test]
    fn test_header_blob_and_payload_chunks() {
        let tmp = write_temp(&sparse_image());
        let ffu = FfuImage::open(tmp.path()).unwrap();
        let blob = ffu.header_blob().unwrap();
        assert_eq!(blob.len(), ffu.header_size() as usize);
        assert_eq!(&blob[0x04..0x10], b"SignedImage ");
        assert!(ffu.payload_chunk(2).unwrap().iter().all(|&b| b == 0x30));
    }
}
