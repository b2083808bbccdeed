//! Lumia bootloader protocol (NOK* command family).
//!
//! All Lumia boot applications share one message shape: a 4-byte ASCII
//! signature, echoed back in the response, with a big-endian u16 status
//! at bytes 6..8 for commands that report one. Extended commands append
//! TLV subblocks (id u8, length u16 BE, data).
//!
//! The phone exposes several applications over the same endpoint pair
//! (bootloader manager, flash application, product support tool); the
//! host switches between them with `NOKS`. On early devices the
//! bootloader and flash application are a single binary and the switch
//! is a no-op, see [`LumiaClient::switch_to_flash_app`].

pub mod flash;
pub mod info;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info as log_info, instrument};

use self::info::{InfoLevel, PhoneInfo};
use super::transport::RawTransport;
use super::ProtocolError;

const SIG_INFO: &[u8; 4] = b"NOKV";
const SIG_SWITCH: &[u8; 4] = b"NOKS";
const SIG_REBOOT: &[u8; 4] = b"NOKR";
const SIG_DISABLE_WATCHDOG: &[u8; 4] = b"NOKD";
const SIG_READ_GPT: &[u8; 4] = b"NOKT";
const SIG_WRITE_GPT: &[u8; 4] = b"NOKM";
/// Extended command signature; `FS` selects secure flash.
const SIG_EXTENDED: &[u8; 4] = b"NOKX";
const EXT_SECURE_FLASH: &[u8; 2] = b"FS";

const READ_BUFFER: usize = 0x8000;

/// Target applications for `NOKS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootApp {
    FlashApp,
    ProductSupportTool,
}

impl BootApp {
    fn as_u8(self) -> u8 {
        match self {
            BootApp::FlashApp => 0x02,
            BootApp::ProductSupportTool => 0x03,
        }
    }
}

/// Flash-application status codes, as reported in command responses.
fn status_message(code: u16) -> &'static str {
    match code {
        0x0001 => "Invalid message",
        0x0002 => "Unknown command",
        0x0003 => "Invalid parameter",
        0x0004 => "Command failed",
        0x0005 => "Command not permitted in this mode",
        0x0006 => "Device is write protected",
        0x0007 => "Message too short",
        0x0008 => "Message out of sequence",
        0x0009 => "Transfer size not supported",
        0x000A => "Invalid subblock",
        0x000B => "Missing mandatory subblock",
        0x0101 => "FFU header parsing error",
        0x0102 => "Security header validation failed",
        0x0103 => "Image header validation failed",
        0x0104 => "Store header validation failed",
        0x0105 => "Hash mismatch in payload chunk",
        0x0106 => "Catalog validation failed",
        0x0107 => "Signature check failed",
        0x0108 => "Anti-rollback violation",
        0x0109 => "Platform ID mismatch",
        0x010A => "Payload out of range",
        0x010B => "Descriptor index out of range",
        0x010C => "CRC mismatch in payload chunk",
        0x0201 => "eMMC write failure",
        0x0202 => "eMMC read failure",
        0x0203 => "eMMC erase failure",
        0x0204 => "Partition table invalid",
        0x0205 => "Partition not found",
        0x0206 => "Not enough space on device",
        0x0301 => "Battery level too low to flash",
        0x0302 => "Device is rebooting",
        _ => "Unknown error",
    }
}

pub struct LumiaClient<T: RawTransport> {
    transport: T,
    info: PhoneInfo,
}

impl<T: RawTransport> LumiaClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            info: PhoneInfo::default(),
        }
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Send a message and read the response, verifying the signature
    /// echo. No status interpretation.
    fn raw_exchange(&mut self, message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.transport.write(message)?;
        let response = self.transport.read(READ_BUFFER)?;
        if response.len() < 4 || response[0..4] != message[0..4] {
            return Err(ProtocolError::BadMessage(format!(
                "response does not echo command {:?}",
                String::from_utf8_lossy(&message[0..4.min(message.len())])
            )));
        }
        Ok(response)
    }

    /// Send a message and check the status word in the response.
    pub(crate) fn command(&mut self, message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let response = self.raw_exchange(message)?;
        if response.len() < 8 {
            return Err(ProtocolError::BadMessage(format!(
                "status response truncated to {} bytes",
                response.len()
            )));
        }
        let code = BigEndian::read_u16(&response[6..8]);
        if code != 0 {
            return Err(ProtocolError::Flash {
                code,
                message: status_message(code),
            });
        }
        Ok(response)
    }

    pub(crate) fn secure_flash_message(subblocks: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut message = Vec::with_capacity(16);
        message.extend_from_slice(SIG_EXTENDED);
        message.extend_from_slice(EXT_SECURE_FLASH);
        message.push(0x00);
        message.push(subblocks.len() as u8);
        for (id, data) in subblocks {
            message.push(*id);
            let mut len = [0u8; 2];
            BigEndian::write_u16(&mut len, data.len() as u16);
            message.extend_from_slice(&len);
            message.extend_from_slice(data);
        }
        message
    }

    /// Phone information, queried from the current application and
    /// cached until the context changes.
    #[instrument(skip(self))]
    pub fn read_info(&mut self) -> Result<&PhoneInfo, ProtocolError> {
        if self.info.level == InfoLevel::Empty {
            let response = self.raw_exchange(SIG_INFO)?;
            self.info = PhoneInfo::parse(&response)?;
            debug!(level = ?self.info.level, "Phone info cached");
        }
        Ok(&self.info)
    }

    /// Switch to the flash application and disable its flash watchdog.
    ///
    /// Early bootloaders (protocol major version 1) host the flash
    /// commands in the same application; the switch silently does
    /// nothing there.
    #[instrument(skip(self))]
    pub fn switch_to_flash_app(&mut self) -> Result<(), ProtocolError> {
        let info = self.read_info()?;
        if info.protocol_major == 1 {
            debug!("Single-application bootloader, no switch needed");
            return Ok(());
        }
        if info.app == info::BootAppKind::FlashApp {
            return Ok(());
        }

        self.command(&[SIG_SWITCH[0], SIG_SWITCH[1], SIG_SWITCH[2], SIG_SWITCH[3],
            BootApp::FlashApp.as_u8(), 0x00])?;
        // Cached info described the previous application.
        self.info = PhoneInfo::default();

        self.command(SIG_DISABLE_WATCHDOG)?;
        log_info!("Switched to flash application");
        Ok(())
    }

    /// Reboot the device. It drops off the bus; no response follows.
    #[instrument(skip(self))]
    pub fn reboot(&mut self) -> Result<(), ProtocolError> {
        self.transport.write(SIG_REBOOT)?;
        self.info = PhoneInfo::default();
        Ok(())
    }

    /// Read the primary GPT (protective MBR plus 33 GPT sectors).
    #[instrument(skip(self))]
    pub fn read_gpt(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.switch_to_flash_app()?;
        let response = self.command(SIG_READ_GPT)?;
        if response.len() <= 8 {
            return Err(ProtocolError::BadMessage(
                "GPT response carries no data".into(),
            ));
        }
        Ok(response[8..].to_vec())
    }

    /// Write a rebuilt partition table back to the device.
    #[instrument(skip(self, table), fields(len = table.len()))]
    pub fn write_gpt(&mut self, table: &[u8]) -> Result<(), ProtocolError> {
        self.switch_to_flash_app()?;
        let mut message = Vec::with_capacity(4 + table.len());
        message.extend_from_slice(SIG_WRITE_GPT);
        message.extend_from_slice(table);
        self.command(&message)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use byteorder::{BigEndian, ByteOrder};

    /// Build a NOK* response: signature echo, status at 6..8, then
    /// extra payload.
    pub fn status_response(sig: &[u8; 4], status: u16, extra: &[u8]) -> Vec<u8> {
        let mut r = vec![0u8; 8];
        r[0..4].copy_from_slice(sig);
        BigEndian::write_u16(&mut r[6..8], status);
        r.extend_from_slice(extra);
        r
    }

    /// Build a NOKV response with the given subblocks.
    pub fn info_response(app: u8, proto_major: u8, subblocks: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(b"NOKV");
        r.push(app);
        r.push(proto_major);
        r.push(0x00); // protocol minor
        r.push(subblocks.len() as u8);
        for (id, data) in subblocks {
            r.push(*id);
            let mut len = [0u8; 2];
            BigEndian::write_u16(&mut len, data.len() as u16);
            r.extend_from_slice(&len);
            r.extend_from_slice(data);
        }
        r
    }
}
