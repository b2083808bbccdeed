//! Binary patches for the Qualcomm secondary bootloaders.
//!
//! SBL2 and SBL3 are plain ARM binaries with no relocation data, so
//! patching works by masked byte-pattern search: locate the security
//! check routine and replace its head with `mov r0, #0` so it reports
//! success unconditionally.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::bytes::find_pattern;

#[derive(Error, Debug)]
pub enum PatcherError {
    #[error("bad image format: {0}")]
    BadImageFormat(String),
}

/// `mov r0, #0` in ARM state.
const ARM_MOV_R0_0: [u8; 4] = [0x00, 0x00, 0xA0, 0xE3];

/// Prologue of the SBL2 firmware authentication routine. The middle
/// words load the certificate chain pointer and vary per build.
const SBL2_AUTH_PATTERN: [u8; 12] = [
    0xF0, 0x40, 0x2D, 0xE9, // push {r4-r7, lr}
    0x00, 0x00, 0x00, 0x00, // ldr rX, [pc, #imm] (masked)
    0x00, 0x40, 0xA0, 0xE1, // mov r4, r0
];
const SBL2_AUTH_MASK: [u8; 12] = [
    0xFF, 0xFF, 0xFF, 0xFF, //
    0x00, 0x00, 0x00, 0x00, //
    0xFF, 0xFF, 0xFF, 0xFF, //
];
/// The verdict register is set this far into the routine.
const SBL2_PATCH_OFFSET: usize = 4;

/// Prologue of the SBL3 secure-boot enforcement check.
const SBL3_CHECK_PATTERN: [u8; 12] = [
    0x10, 0x40, 0x2D, 0xE9, // push {r4, lr}
    0x00, 0x00, 0x00, 0x00, // ldr rX, [pc, #imm] (masked)
    0x00, 0x00, 0x50, 0xE3, // cmp r0, #0
];
const SBL3_CHECK_MASK: [u8; 12] = [
    0xFF, 0xFF, 0xFF, 0xFF, //
    0x00, 0x00, 0x00, 0x00, //
    0xFF, 0xFF, 0xFF, 0xFF, //
];
const SBL3_PATCH_OFFSET: usize = 8;

fn patch_at(
    binary: &mut [u8],
    pattern: &[u8],
    mask: &[u8],
    patch_offset: usize,
    what: &str,
) -> Result<(), PatcherError> {
    let position = find_pattern(binary, pattern, mask).ok_or_else(|| {
        PatcherError::BadImageFormat(format!("{what} routine not found"))
    })?;
    debug!(what, offset = %format!("0x{:X}", position + patch_offset), "Patching");
    binary[position + patch_offset..position + patch_offset + 4]
        .copy_from_slice(&ARM_MOV_R0_0);
    Ok(())
}

/// Neutralize the firmware authentication check in SBL2.
#[instrument(skip(binary), fields(len = binary.len()))]
pub fn patch_sbl2(binary: &mut [u8]) -> Result<(), PatcherError> {
    patch_at(
        binary,
        &SBL2_AUTH_PATTERN,
        &SBL2_AUTH_MASK,
        SBL2_PATCH_OFFSET,
        "SBL2 authentication",
    )
}

/// Neutralize the secure-boot enforcement check in SBL3.
#[instrument(skip(binary), fields(len = binary.len()))]
pub fn patch_sbl3(binary: &mut [u8]) -> Result<(), PatcherError> {
    patch_at(
        binary,
        &SBL3_CHECK_PATTERN,
        &SBL3_CHECK_MASK,
        SBL3_PATCH_OFFSET,
        "SBL3 secure-boot",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sbl2_binary() -> Vec<u8> {
        let mut b = vec![0xFFu8; 0x100];
        b[0x40..0x44].copy_from_slice(&[0xF0, 0x40, 0x2D, 0xE9]);
        b[0x44..0x48].copy_from_slice(&[0x28, 0x10, 0x9F, 0xE5]); // varies per build
        b[0x48..0x4C].copy_from_slice(&[0x00, 0x40, 0xA0, 0xE1]);
        b
    }

    #[test]
    fn test_patch_sbl2_rewrites_verdict() {
        let mut binary = sbl2_binary();
        patch_sbl2(&mut binary).unwrap();
        assert_eq!(&binary[0x44..0x48], &ARM_MOV_R0_0);
        // Prologue untouched.
        assert_eq!(&binary[0x40..0x44], &[0xF0, 0x40, 0x2D, 0xE9]);
    }

    #[test]
    fn test_patch_sbl3_rewrites_comparison() {
        let mut binary = vec![0u8; 0x100];
        binary[0x20..0x24].copy_from_slice(&[0x10, 0x40, 0x2D, 0xE9]);
        binary[0x24..0x28].copy_from_slice(&[0x14, 0x30, 0x9F, 0xE5]);
        binary[0x28..0x2C].copy_from_slice(&[0x00, 0x00, 0x50, 0xE3]);

        patch_sbl3(&mut binary).unwrap();
        assert_eq!(&binary[0x28..0x2C], &ARM_MOV_R0_0);
    }

    #[test]
    fn test_patch_rejects_unrecognized_binary() {
        let mut binary = vec![0x5Au8; 0x100];
        assert!(matches!(
            patch_sbl2(&mut binary),
            Err(PatcherError::BadImageFormat(_))
        ));
        assert!(matches!(
            patch_sbl3(&mut binary),
            Err(PatcherError::BadImageFormat(_))
        ));
    }
}
