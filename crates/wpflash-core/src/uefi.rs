//! UEFI firmware volume model.
//!
//! Lumia UEFI partitions are a Qualcomm MBN header in front of an EDK2
//! firmware volume. One outer FFS file (type 0x0B) wraps a GUID-defined
//! section whose payload is an LZMA-compressed inner volume; the inner
//! volume's files are the actual boot modules, each carrying a UTF-16
//! name section and a PE or raw binary section. This module parses the
//! whole nest, supports module replacement with full size-delta
//! propagation, and rebuilds the compressed container in place.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{debug, info};

use crate::bytes::{checksum8, checksum16, find_ascii, find_pattern, read_utf16_trimmed};
use crate::gpt::guid_to_string;

const FV_SIGNATURE: &[u8] = b"_FVH";
/// Qualcomm MBN header in front of the outer volume.
const MBN_HEADER_SIZE: usize = 0x28;
const FFS_HEADER_SIZE: usize = 24;

/// FFS file types and section types this model cares about.
const FILE_TYPE_VOLUME_IMAGE: u8 = 0x0B;
const FILE_TYPE_PAD: u8 = 0xF0;
const SECTION_GUID_DEFINED: u8 = 0x02;
const SECTION_PE32: u8 = 0x10;
const SECTION_UI: u8 = 0x15;
const SECTION_VOLUME_IMAGE: u8 = 0x17;
const SECTION_RAW: u8 = 0x19;

/// FFS attribute bit: file carries a content checksum.
const FFS_ATTRIB_CHECKSUM: u8 = 0x40;

const SECURITY_DXE: &str = "SecurityDxe";
const SECURITY_SERVICES_DXE: &str = "SecurityServicesDxe";

/// Thumb prologue of SecurityDxe's image-verification routine; the
/// third byte varies between builds.
const SECURITY_DXE_PATTERN: [u8; 6] = [0x10, 0xB5, 0x00, 0x46, 0x00, 0x23];
const SECURITY_DXE_MASK: [u8; 6] = [0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF];
/// movs r0, #0 ; bx lr
const SECURITY_DXE_PATCH: [u8; 4] = [0x00, 0x20, 0x70, 0x47];

/// ARM prologue of SecurityServicesDxe's signature check.
const SECURITY_SERVICES_PATTERN: [u8; 4] = [0xF0, 0x41, 0x2D, 0xE9];
const SECURITY_SERVICES_MASK: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
/// mov r0, #0 ; bx lr
const SECURITY_SERVICES_PATCH: [u8; 8] = [0x00, 0x00, 0xA0, 0xE3, 0x1E, 0xFF, 0x2F, 0xE1];

#[derive(Error, Debug)]
pub enum UefiError {
    #[error("bad firmware volume: {0}")]
    BadImageFormat(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn bad(reason: impl Into<String>) -> UefiError {
    UefiError::BadImageFormat(reason.into())
}

/// One module inside the inner firmware volume. Offsets are relative
/// to the decompressed volume stream.
#[derive(Debug, Clone)]
pub struct Efi {
    pub guid: [u8; 16],
    pub name: String,
    pub file_type: u8,
    pub file_offset: usize,
    pub section_offset: usize,
    pub binary_offset: usize,
    pub size: usize,
}

#[derive(Debug)]
pub struct UefiImage {
    binary: Vec<u8>,
    /// Decompressed stream: volume-image section wrapper + inner volume.
    volume: Vec<u8>,
    pub efis: Vec<Efi>,
    volume_offset: usize,
    outer_file_offset: usize,
    guid_section_offset: usize,
    compressed_offset: usize,
    wrapper_offset: usize,
    inner_volume_offset: usize,
}

fn read_u24(buf: &[u8], offset: usize) -> usize {
    buf[offset] as usize | (buf[offset + 1] as usize) << 8 | (buf[offset + 2] as usize) << 16
}

fn write_u24(buf: &mut [u8], offset: usize, value: usize) {
    buf[offset] = value as u8;
    buf[offset + 1] = (value >> 8) as u8;
    buf[offset + 2] = (value >> 16) as u8;
}

fn round4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

fn round8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// Validate an FFS file header: 8-bit sum over the 24 header bytes,
/// with the content-checksum and state bytes taken as zero, must be 0.
fn file_header_valid(header: &[u8]) -> bool {
    let mut copy = [0u8; FFS_HEADER_SIZE];
    copy.copy_from_slice(&header[..FFS_HEADER_SIZE]);
    copy[0x11] = 0;
    copy[0x17] = 0;
    checksum8(&copy) == 0
}

fn file_content_valid(header: &[u8], content: &[u8]) -> bool {
    let stored = header[0x11];
    if header[0x13] & FFS_ATTRIB_CHECKSUM != 0 {
        stored == 0u8.wrapping_sub(checksum8(content))
    } else {
        stored == 0xAA
    }
}

fn fix_file_checksums(volume: &mut [u8], file_offset: usize, file_size: usize) {
    let attributes = volume[file_offset + 0x13];
    let content_checksum = if attributes & FFS_ATTRIB_CHECKSUM != 0 {
        let content = &volume[file_offset + FFS_HEADER_SIZE..file_offset + file_size];
        0u8.wrapping_sub(checksum8(content))
    } else {
        0xAA
    };
    volume[file_offset + 0x11] = content_checksum;

    let mut copy = [0u8; FFS_HEADER_SIZE];
    copy.copy_from_slice(&volume[file_offset..file_offset + FFS_HEADER_SIZE]);
    copy[0x10] = 0;
    copy[0x11] = 0;
    copy[0x17] = 0;
    volume[file_offset + 0x10] = 0u8.wrapping_sub(checksum8(&copy));
}

fn fix_volume_checksum(volume: &mut [u8], fv_offset: usize) {
    let header_length =
        u16::from_le_bytes([volume[fv_offset + 0x30], volume[fv_offset + 0x31]]) as usize;
    volume[fv_offset + 0x32] = 0;
    volume[fv_offset + 0x33] = 0;
    let sum = checksum16(&volume[fv_offset..fv_offset + header_length]);
    let fix = 0u16.wrapping_sub(sum);
    volume[fv_offset + 0x32..fv_offset + 0x34].copy_from_slice(&fix.to_le_bytes());
}

struct VolumeHeader {
    header_length: usize,
    fv_length: u64,
}

fn parse_volume_header(buf: &[u8], fv_offset: usize) -> Result<VolumeHeader, UefiError> {
    if fv_offset + 0x38 > buf.len() || &buf[fv_offset + 0x28..fv_offset + 0x2C] != FV_SIGNATURE {
        return Err(bad("missing _FVH signature"));
    }
    let mut c = Cursor::new(&buf[fv_offset + 0x20..]);
    let fv_length = c.read_u64::<LittleEndian>()?;
    let header_length =
        u16::from_le_bytes([buf[fv_offset + 0x30], buf[fv_offset + 0x31]]) as usize;
    if fv_offset + header_length > buf.len() {
        return Err(bad("volume header exceeds buffer"));
    }
    if checksum16(&buf[fv_offset..fv_offset + header_length]) != 0 {
        return Err(bad("volume header checksum invalid"));
    }
    Ok(VolumeHeader {
        header_length,
        fv_length,
    })
}

impl UefiImage {
    /// Parse an MBN-wrapped (or bare) firmware volume.
    pub fn parse(binary: Vec<u8>) -> Result<Self, UefiError> {
        let signature =
            find_ascii(&binary, FV_SIGNATURE).ok_or_else(|| bad("missing _FVH signature"))?;
        if signature < 0x28 {
            return Err(bad("signature before volume header start"));
        }
        let volume_offset = signature - 0x28;
        let outer = parse_volume_header(&binary, volume_offset)?;
        let volume_end = volume_offset + outer.fv_length as usize;
        if volume_end > binary.len() {
            return Err(bad("volume length exceeds file"));
        }

        // Outer file walk, stopping at the volume-image carrier.
        let mut offset = volume_offset + outer.header_length;
        let outer_file_offset = loop {
            offset = volume_offset + round8(offset - volume_offset);
            if offset + FFS_HEADER_SIZE > volume_end {
                return Err(bad("no volume-image file in outer volume"));
            }
            let header = &binary[offset..offset + FFS_HEADER_SIZE];
            if header[..16] == [0xFF; 16] {
                return Err(bad("no volume-image file in outer volume"));
            }
            let size = read_u24(header, 0x14);
            if !file_header_valid(header) {
                return Err(bad(format!("outer file header checksum at 0x{offset:X}")));
            }
            if !file_content_valid(header, &binary[offset + FFS_HEADER_SIZE..offset + size]) {
                return Err(bad(format!("outer file content checksum at 0x{offset:X}")));
            }
            if header[0x12] == FILE_TYPE_VOLUME_IMAGE {
                break offset;
            }
            offset += size;
        };

        // GUID-defined section holding the compressed inner volume.
        let file_size = read_u24(&binary, outer_file_offset + 0x14);
        let file_end = outer_file_offset + file_size;
        let mut s = outer_file_offset + FFS_HEADER_SIZE;
        let guid_section_offset = loop {
            s = round4(s);
            if s + 4 > file_end {
                return Err(bad("no GUID-defined section in outer file"));
            }
            let size = read_u24(&binary, s);
            if binary[s + 3] == SECTION_GUID_DEFINED {
                break s;
            }
            s += size;
        };
        let section_size = read_u24(&binary, guid_section_offset);
        let data_offset = u16::from_le_bytes([
            binary[guid_section_offset + 20],
            binary[guid_section_offset + 21],
        ]) as usize;
        let compressed_offset = guid_section_offset + data_offset;
        let compressed_end = guid_section_offset + section_size;
        if compressed_end > file_end {
            return Err(bad("GUID-defined section exceeds file"));
        }

        let mut volume = Vec::new();
        lzma_rs::lzma_decompress(
            &mut &binary[compressed_offset..compressed_end],
            &mut volume,
        )
        .map_err(|e| bad(format!("inner volume LZMA: {e}")))?;

        // The decompressed stream is a volume-image section wrapper.
        if volume.len() < 4 || volume[3] != SECTION_VOLUME_IMAGE {
            return Err(bad("decompressed stream is not a volume-image section"));
        }
        let wrapper_offset = 0;
        let inner_volume_offset = wrapper_offset + 4;
        let inner = parse_volume_header(&volume, inner_volume_offset)?;
        let inner_end = inner_volume_offset + inner.fv_length as usize;
        if inner_end > volume.len() {
            return Err(bad("inner volume length exceeds stream"));
        }

        let efis = Self::walk_inner_files(
            &volume,
            inner_volume_offset,
            inner_volume_offset + inner.header_length,
            inner_end,
        )?;

        info!(
            modules = efis.len(),
            compressed = compressed_end - compressed_offset,
            decompressed = volume.len(),
            "Parsed UEFI firmware volume"
        );

        Ok(Self {
            binary,
            volume,
            efis,
            volume_offset,
            outer_file_offset,
            guid_section_offset,
            compressed_offset,
            wrapper_offset,
            inner_volume_offset,
        })
    }

    fn walk_inner_files(
        volume: &[u8],
        fv_offset: usize,
        start: usize,
        end: usize,
    ) -> Result<Vec<Efi>, UefiError> {
        let mut efis = Vec::new();
        let mut offset = start;
        loop {
            offset = fv_offset + round8(offset - fv_offset);
            if offset + FFS_HEADER_SIZE > end {
                break;
            }
            let header = &volume[offset..offset + FFS_HEADER_SIZE];
            if header[..16] == [0xFF; 16] {
                break;
            }
            let size = read_u24(header, 0x14);
            if size < FFS_HEADER_SIZE || offset + size > end {
                return Err(bad(format!("inner file size at 0x{offset:X}")));
            }
            if !file_header_valid(header) {
                return Err(bad(format!("inner file header checksum at 0x{offset:X}")));
            }
            if !file_content_valid(header, &volume[offset + FFS_HEADER_SIZE..offset + size]) {
                return Err(bad(format!("inner file content checksum at 0x{offset:X}")));
            }
            let file_type = header[0x12];
            if file_type == FILE_TYPE_PAD {
                offset += size;
                continue;
            }

            let mut name = String::new();
            let mut section_offset = 0usize;
            let mut binary_offset = 0usize;
            let mut binary_size = 0usize;
            let mut s = offset + FFS_HEADER_SIZE;
            while s + 4 <= offset + size {
                s = round4(s);
                if s + 4 > offset + size {
                    break;
                }
                let sec_size = read_u24(volume, s);
                if sec_size < 4 || s + sec_size > offset + size {
                    return Err(bad(format!("inner section size at 0x{s:X}")));
                }
                match volume[s + 3] {
                    SECTION_UI => {
                        name = read_utf16_trimmed(&volume[s + 4..s + sec_size]);
                    }
                    SECTION_PE32 | SECTION_RAW => {
                        section_offset = s;
                        binary_offset = s + 4;
                        binary_size = sec_size - 4;
                    }
                    _ => {}
                }
                s += sec_size;
            }

            if binary_size > 0 {
                efis.push(Efi {
                    guid: volume[offset..offset + 16].try_into().unwrap(),
                    name,
                    file_type,
                    file_offset: offset,
                    section_offset,
                    binary_offset,
                    size: binary_size,
                });
            }
            offset += size;
        }
        Ok(efis)
    }

    fn find_efi(&self, name_or_guid: &str) -> Option<usize> {
        self.efis.iter().position(|e| {
            e.name.eq_ignore_ascii_case(name_or_guid)
                || guid_to_string(&e.guid).eq_ignore_ascii_case(name_or_guid)
        })
    }

    /// A module's binary, looked up by name or GUID string.
    pub fn get_file(&self, name_or_guid: &str) -> Option<Vec<u8>> {
        let e = &self.efis[self.find_efi(name_or_guid)?];
        Some(self.volume[e.binary_offset..e.binary_offset + e.size].to_vec())
    }

    /// Replace a module's binary, propagating the padded size delta
    /// through the section, file, inner volume and outer section size
    /// fields and every later module's recorded offsets.
    pub fn replace_file(&mut self, name: &str, new_binary: &[u8]) -> Result<(), UefiError> {
        let i = self
            .find_efi(name)
            .ok_or_else(|| bad(format!("module {name} not present")))?;
        let e = self.efis[i].clone();

        let old_file_size = read_u24(&self.volume, e.file_offset + 0x14);
        // The binary section is the last section of its file.
        if e.binary_offset + e.size != e.file_offset + old_file_size {
            return Err(bad(format!("module {name} has trailing sections")));
        }
        let new_file_size = old_file_size - e.size + new_binary.len();
        if new_file_size >= 1 << 24 {
            return Err(bad(format!("module {name} replacement too large")));
        }
        let old_span = round8(old_file_size);
        let new_span = round8(new_file_size);
        let delta = new_span as isize - old_span as isize;

        // Splice: new binary plus 8-byte file padding.
        let mut replacement = new_binary.to_vec();
        replacement.resize(new_span - (e.binary_offset - e.file_offset), 0xFF);
        self.volume
            .splice(e.binary_offset..e.file_offset + old_span, replacement);

        write_u24(&mut self.volume, e.section_offset, 4 + new_binary.len());
        write_u24(&mut self.volume, e.file_offset + 0x14, new_file_size);

        // Inner volume length and its wrapper section grow with the file.
        let fv = self.inner_volume_offset;
        let fv_length = u64::from_le_bytes(self.volume[fv + 0x20..fv + 0x28].try_into().unwrap());
        let new_fv_length = fv_length.checked_add_signed(delta as i64).unwrap_or(fv_length);
        self.volume[fv + 0x20..fv + 0x28].copy_from_slice(&new_fv_length.to_le_bytes());
        let wrapper_size = read_u24(&self.volume, self.wrapper_offset);
        write_u24(
            &mut self.volume,
            self.wrapper_offset,
            (wrapper_size as isize + delta) as usize,
        );
        // The outer GUID-defined section tracks the same delta until
        // rebuild() recomputes it from the actual compressed size.
        let outer_size = read_u24(&self.binary, self.guid_section_offset);
        write_u24(
            &mut self.binary,
            self.guid_section_offset,
            (outer_size as isize + delta) as usize,
        );

        fix_file_checksums(&mut self.volume, e.file_offset, new_file_size);
        fix_volume_checksum(&mut self.volume, fv);

        self.efis[i].size = new_binary.len();
        for f in &mut self.efis {
            if f.file_offset > e.file_offset {
                f.file_offset = (f.file_offset as isize + delta) as usize;
                f.section_offset = (f.section_offset as isize + delta) as usize;
                f.binary_offset = (f.binary_offset as isize + delta) as usize;
            }
        }

        debug!(module = %name, old = e.size, new = new_binary.len(), delta, "Replaced module");
        Ok(())
    }

    /// Recompress the inner volume into the original container.
    ///
    /// The outer partition size is fixed, so the compressed stream must
    /// fit the space the original occupied (plus trailing free space);
    /// the MBN signature and certificate fields are zeroed since the
    /// original signature no longer matches.
    pub fn rebuild(&mut self) -> Result<Vec<u8>, UefiError> {
        let mut compressed = Vec::new();
        lzma_rs::lzma_compress(&mut &self.volume[..], &mut compressed)
            .map_err(|e| bad(format!("inner volume recompression: {e}")))?;

        let mut out = self.binary.clone();
        let available = out.len() - self.compressed_offset;
        if compressed.len() > available {
            return Err(bad("patched volume does not fit the container"));
        }
        out[self.compressed_offset..self.compressed_offset + compressed.len()]
            .copy_from_slice(&compressed);
        out[self.compressed_offset + compressed.len()..].fill(0xFF);

        let data_offset = self.compressed_offset - self.guid_section_offset;
        let section_size = data_offset + compressed.len();
        write_u24(&mut out, self.guid_section_offset, section_size);
        let file_size = (self.guid_section_offset - self.outer_file_offset) + section_size;
        write_u24(&mut out, self.outer_file_offset + 0x14, file_size);
        fix_file_checksums(&mut out, self.outer_file_offset, file_size);
        fix_volume_checksum(&mut out, self.volume_offset);

        // MBN signature pointer/size and certificate chain fields.
        if self.volume_offset >= MBN_HEADER_SIZE {
            let mbn = self.volume_offset - MBN_HEADER_SIZE;
            out[mbn + 0x18..mbn + 0x28].fill(0);
        }

        info!(compressed = compressed.len(), available, "Rebuilt firmware volume");
        Ok(out)
    }

    /// Neutralize the secure-boot checks: overwrite the verification
    /// prologues in SecurityDxe and SecurityServicesDxe with
    /// unconditional-success returns, clear their PE checksums, and
    /// rebuild the container.
    pub fn patch(&mut self) -> Result<Vec<u8>, UefiError> {
        let edits: [(&str, &[u8], &[u8], &[u8]); 2] = [
            (
                SECURITY_DXE,
                &SECURITY_DXE_PATTERN,
                &SECURITY_DXE_MASK,
                &SECURITY_DXE_PATCH,
            ),
            (
                SECURITY_SERVICES_DXE,
                &SECURITY_SERVICES_PATTERN,
                &SECURITY_SERVICES_MASK,
                &SECURITY_SERVICES_PATCH,
            ),
        ];
        for (module, pattern, mask, patch) in edits {
            let mut bin = self
                .get_file(module)
                .ok_or_else(|| bad(format!("module {module} not present")))?;
            let at = find_pattern(&bin, pattern, mask)
                .ok_or_else(|| bad(format!("security-check pattern not found in {module}")))?;
            if at + patch.len() > bin.len() {
                return Err(bad(format!("security-check pattern truncated in {module}")));
            }
            bin[at..at + patch.len()].copy_from_slice(patch);
            clear_pe_checksum(&mut bin);
            self.replace_file(module, &bin)?;
            info!(module, offset = at, "Patched security check");
        }
        self.rebuild()
    }
}

/// Zero the optional-header checksum of a PE image, if it is one.
fn clear_pe_checksum(binary: &mut [u8]) {
    if binary.len() < 0x40 || &binary[..2] != b"MZ" {
        return;
    }
    let e_lfanew = u32::from_le_bytes(binary[0x3C..0x40].try_into().unwrap()) as usize;
    if e_lfanew + 0x5C > binary.len() || &binary[e_lfanew..e_lfanew + 4] != b"PE\0\0" {
        return;
    }
    binary[e_lfanew + 0x58..e_lfanew + 0x5C].fill(0);
}
