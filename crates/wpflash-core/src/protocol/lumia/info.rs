//! NOKV phone-information parsing.

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

use crate::protocol::ProtocolError;

/// How much of the phone's state the cached info describes. The
/// bootloader manager answers a subset of the subblocks the flash
/// application does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoLevel {
    #[default]
    Empty,
    Basic,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootAppKind {
    #[default]
    BootManager,
    FlashApp,
    ProductSupportTool,
    Unknown(u8),
}

impl BootAppKind {
    fn from_u8(v: u8) -> Self {
        match v {
            0x01 => BootAppKind::BootManager,
            0x02 => BootAppKind::FlashApp,
            0x03 => BootAppKind::ProductSupportTool,
            other => BootAppKind::Unknown(other),
        }
    }
}

/// Secure-boot posture reported in subblock 0x0F.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityPosture {
    pub platform_secure_boot: bool,
    pub secure_ffu: bool,
    pub jtag_disabled: bool,
    pub rdc_present: bool,
    pub authenticated: bool,
    pub uefi_secure_boot: bool,
    pub secondary_hardware_key: bool,
}

/// Secure-FFU protocol generations advertised in subblock 0x10.
pub const FFU_PROTOCOL_V1: u16 = 0x0001;
pub const FFU_PROTOCOL_V2: u16 = 0x0002;
pub const FFU_PROTOCOL_V3: u16 = 0x0004;

const SUB_TRANSFER_SIZE: u8 = 0x01;
const SUB_WRITE_BUFFER_SIZE: u8 = 0x02;
const SUB_EMMC_SECTORS: u8 = 0x03;
const SUB_APP_VERSION: u8 = 0x04;
const SUB_PLATFORM_ID: u8 = 0x05;
const SUB_ASYNC_SUPPORT: u8 = 0x0D;
const SUB_SECURITY: u8 = 0x0F;
const SUB_PROTOCOL_MASK: u8 = 0x10;
const SUB_MMOS_OVER_USB: u8 = 0x1F;

#[derive(Debug, Clone, Default)]
pub struct PhoneInfo {
    pub level: InfoLevel,
    pub app: BootAppKind,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    /// Largest NOK* message the phone accepts.
    pub transfer_size: u32,
    /// Secure-flash payload bytes per message (V2 and later).
    pub write_buffer_size: u32,
    pub emmc_sectors: u32,
    pub platform_id: String,
    /// Application version of the answering context.
    pub app_version: Option<(u8, u8)>,
    pub async_support: bool,
    pub security: SecurityPosture,
    pub ffu_protocol_mask: u16,
    pub mmos_over_usb: bool,
}

impl PhoneInfo {
    /// Parse a NOKV response: signature, app byte, protocol version
    /// pair, subblock count, then the subblocks themselves.
    pub fn parse(response: &[u8]) -> Result<Self, ProtocolError> {
        if response.len() < 8 {
            return Err(ProtocolError::BadMessage(format!(
                "info response truncated to {} bytes",
                response.len()
            )));
        }
        let app = BootAppKind::from_u8(response[4]);
        let mut info = PhoneInfo {
            level: if app == BootAppKind::FlashApp {
                InfoLevel::Extended
            } else {
                InfoLevel::Basic
            },
            app,
            protocol_major: response[5],
            protocol_minor: response[6],
            ..PhoneInfo::default()
        };

        let count = response[7] as usize;
        let mut offset = 8;
        for _ in 0..count {
            if offset + 3 > response.len() {
                return Err(ProtocolError::BadMessage(
                    "info subblock header out of bounds".into(),
                ));
            }
            let id = response[offset];
            let len = BigEndian::read_u16(&response[offset + 1..offset + 3]) as usize;
            offset += 3;
            if offset + len > response.len() {
                return Err(ProtocolError::BadMessage(format!(
                    "info subblock 0x{id:02X} overruns the response"
                )));
            }
            info.apply_subblock(id, &response[offset..offset + len]);
            offset += len;
        }
        Ok(info)
    }

    fn apply_subblock(&mut self, id: u8, data: &[u8]) {
        match (id, data.len()) {
            (SUB_TRANSFER_SIZE, 4..) => self.transfer_size = BigEndian::read_u32(&data[0..4]),
            (SUB_WRITE_BUFFER_SIZE, 4..) => {
                self.write_buffer_size = BigEndian::read_u32(&data[0..4])
            }
            (SUB_EMMC_SECTORS, 4..) => self.emmc_sectors = BigEndian::read_u32(&data[0..4]),
            (SUB_APP_VERSION, 2..) => self.app_version = Some((data[0], data[1])),
            (SUB_PLATFORM_ID, _) => {
                self.platform_id = String::from_utf8_lossy(data)
                    .trim_end_matches('\0')
                    .to_string()
            }
            (SUB_ASYNC_SUPPORT, 1..) => self.async_support = data[0] != 0,
            (SUB_SECURITY, 8..) => {
                self.security = SecurityPosture {
                    platform_secure_boot: data[0] != 0,
                    secure_ffu: data[1] != 0,
                    jtag_disabled: data[2] != 0,
                    rdc_present: data[3] != 0,
                    authenticated: data[4] != 0,
                    uefi_secure_boot: data[5] != 0,
                    secondary_hardware_key: data[6] != 0,
                }
            }
            (SUB_PROTOCOL_MASK, 2..) => {
                self.ffu_protocol_mask = BigEndian::read_u16(&data[0..2])
            }
            (SUB_MMOS_OVER_USB, 1..) => self.mmos_over_usb = data[0] != 0,
            _ => warn!(id = %format!("0x{id:02X}"), len = data.len(), "Ignoring info subblock"),
        }
    }

    /// Best secure-FFU generation both sides support.
    pub fn best_ffu_protocol(&self) -> u16 {
        if self.ffu_protocol_mask & FFU_PROTOCOL_V3 != 0 {
            FFU_PROTOCOL_V3
        } else if self.ffu_protocol_mask & FFU_PROTOCOL_V2 != 0 {
            FFU_PROTOCOL_V2
        } else {
            FFU_PROTOCOL_V1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::lumia::testutil::info_response;

    #[test]
    fn test_parse_full_flash_app_info() {
        let mut mask = [0u8; 2];
        BigEndian::write_u16(&mut mask, FFU_PROTOCOL_V1 | FFU_PROTOCOL_V2);
        let response = info_response(
            0x02,
            2,
            &[
                (SUB_TRANSFER_SIZE, 0x0000_8000u32.to_be_bytes().to_vec()),
                (SUB_WRITE_BUFFER_SIZE, 0x0010_0000u32.to_be_bytes().to_vec()),
                (SUB_EMMC_SECTORS, 0x03A0_0000u32.to_be_bytes().to_vec()),
                (SUB_PLATFORM_ID, b"RM-984\0\0".to_vec()),
                (SUB_SECURITY, vec![1, 1, 1, 0, 0, 1, 0, 0]),
                (SUB_PROTOCOL_MASK, mask.to_vec()),
                (SUB_ASYNC_SUPPORT, vec![1]),
                (SUB_MMOS_OVER_USB, vec![1]),
            ],
        );

        let info = PhoneInfo::parse(&response).unwrap();
        assert_eq!(info.level, InfoLevel::Extended);
        assert_eq!(info.app, BootAppKind::FlashApp);
        assert_eq!(info.transfer_size, 0x8000);
        assert_eq!(info.write_buffer_size, 0x10_0000);
        assert_eq!(info.platform_id, "RM-984");
        assert!(info.security.platform_secure_boot);
        assert!(info.security.secure_ffu);
        assert!(!info.security.rdc_present);
        assert!(info.security.uefi_secure_boot);
        assert!(info.async_support);
        assert!(info.mmos_over_usb);
        assert_eq!(info.best_ffu_protocol(), FFU_PROTOCOL_V2);
    }

    #[test]
    fn test_bootloader_info_is_basic() {
        let info = PhoneInfo::parse(&info_response(0x01, 1, &[])).unwrap();
        assert_eq!(info.level, InfoLevel::Basic);
        assert_eq!(info.app, BootAppKind::BootManager);
        assert_eq!(info.protocol_major, 1);
    }

    #[test]
    fn test_unknown_subblock_is_ignored() {
        let response = info_response(0x02, 2, &[(0x7E, vec![0xAA; 5])]);
        let info = PhoneInfo::parse(&response).unwrap();
        assert_eq!(info.level, InfoLevel::Extended);
    }

    #[test]
    fn test_overrunning_subblock_is_rejected() {
        let mut response = info_response(0x02, 2, &[(SUB_TRANSFER_SIZE, vec![0; 4])]);
        let n = response.len();
        response.truncate(n - 2);
        assert!(PhoneInfo::parse(&response).is_err());
    }

    #[test]
    fn test_protocol_mask_fallback_is_v1() {
        let info = PhoneInfo::parse(&info_response(0x02, 2, &[])).unwrap();
        assert_eq!(info.best_ffu_protocol(), FFU_PROTOCOL_V1);
    }
}
