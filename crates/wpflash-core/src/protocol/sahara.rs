//! Sahara protocol: the boot ROM loader on Qualcomm emergency-download
//! devices (USB PID 9008).
//!
//! The device speaks first. It sends a Hello immediately after
//! enumeration and then pulls the programmer image with ReadData
//! requests; the host only answers. Packets are raw (unframed) with a
//! common 8-byte header: command u32 LE, total packet length u32 LE.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use super::transport::RawTransport;
use super::ProtocolError;

const CMD_HELLO: u32 = 0x01;
const CMD_HELLO_RESPONSE: u32 = 0x02;
const CMD_READ_DATA: u32 = 0x03;
const CMD_END_IMAGE_TRANSFER: u32 = 0x04;
const CMD_DONE: u32 = 0x05;
const CMD_DONE_RESPONSE: u32 = 0x06;
const CMD_EXECUTE: u32 = 0x0D;
const CMD_EXECUTE_RESPONSE: u32 = 0x0E;
const CMD_EXECUTE_DATA: u32 = 0x0F;

/// Execute-mode client command returning the OEM public key hashes.
const EXEC_OEM_PK_HASH: u32 = 0x03;

const PROTOCOL_VERSION: u32 = 2;
const RKH_LEN: usize = 32;

/// Host mode requested in the HelloResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaMode {
    ImageTransfer,
    Command,
}

impl SaharaMode {
    fn as_u32(self) -> u32 {
        match self {
            SaharaMode::ImageTransfer => 0,
            SaharaMode::Command => 3,
        }
    }
}

pub struct SaharaClient<T: RawTransport> {
    transport: T,
}

impl<T: RawTransport> SaharaClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn read_packet(&mut self) -> Result<(u32, Vec<u8>), ProtocolError> {
        let raw = self.transport.read(0x1000)?;
        if raw.len() < 8 {
            return Err(ProtocolError::BadMessage(format!(
                "Sahara packet shorter than its header ({} bytes)",
                raw.len()
            )));
        }
        let command = LittleEndian::read_u32(&raw[0..4]);
        let length = LittleEndian::read_u32(&raw[4..8]) as usize;
        if length < 8 || length > raw.len() {
            return Err(ProtocolError::BadMessage(format!(
                "Sahara packet length field {length} does not match {} received bytes",
                raw.len()
            )));
        }
        Ok((command, raw[8..length].to_vec()))
    }

    fn write_packet(&mut self, command: u32, body: &[u8]) -> Result<(), ProtocolError> {
        let length = (8 + body.len()) as u32;
        let mut packet = vec![0u8; 8 + body.len()];
        LittleEndian::write_u32(&mut packet[0..4], command);
        LittleEndian::write_u32(&mut packet[4..8], length);
        packet[8..].copy_from_slice(body);
        Ok(self.transport.write(&packet)?)
    }

    /// Consume the device's Hello and answer with the requested mode.
    ///
    /// Must run promptly after the device enumerates; the boot ROM
    /// resets if its Hello goes unanswered.
    #[instrument(skip(self))]
    pub fn handshake(&mut self, mode: SaharaMode) -> Result<(), ProtocolError> {
        let (command, body) = self.read_packet()?;
        if command != CMD_HELLO {
            return Err(ProtocolError::BadMessage(format!(
                "expected Sahara Hello, got command 0x{command:02X}"
            )));
        }
        if body.len() < 16 {
            return Err(ProtocolError::BadMessage(
                "Sahara Hello truncated".into(),
            ));
        }
        let version = LittleEndian::read_u32(&body[0..4]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::NotSupported(format!(
                "Sahara protocol version {version}"
            )));
        }
        debug!(version, ?mode, "Hello received");

        // version, minimum supported version, status, mode, 6 reserved words
        let mut response = [0u8; 40];
        LittleEndian::write_u32(&mut response[0..4], PROTOCOL_VERSION);
        LittleEndian::write_u32(&mut response[4..8], 1);
        LittleEndian::write_u32(&mut response[8..12], 0);
        LittleEndian::write_u32(&mut response[12..16], mode.as_u32());
        self.write_packet(CMD_HELLO_RESPONSE, &response)
    }

    /// Serve ReadData requests until the device signals the end of the
    /// image transfer.
    #[instrument(skip(self, image), fields(image_len = image.len()))]
    pub fn send_image(&mut self, image: &[u8]) -> Result<(), ProtocolError> {
        loop {
            let (command, body) = self.read_packet()?;
            match command {
                CMD_READ_DATA => {
                    if body.len() < 12 {
                        return Err(ProtocolError::BadMessage(
                            "Sahara ReadData truncated".into(),
                        ));
                    }
                    let offset = LittleEndian::read_u32(&body[4..8]) as usize;
                    let length = LittleEndian::read_u32(&body[8..12]) as usize;
                    let end = offset.checked_add(length).filter(|&e| e <= image.len());
                    let Some(end) = end else {
                        return Err(ProtocolError::BadMessage(format!(
                            "device requested bytes {offset}..{} beyond image of {} bytes",
                            offset + length,
                            image.len()
                        )));
                    };
                    debug!(offset, length, "Serving ReadData");
                    self.transport.write(&image[offset..end])?;
                }
                CMD_END_IMAGE_TRANSFER => {
                    if body.len() < 8 {
                        return Err(ProtocolError::BadMessage(
                            "Sahara EndImageTransfer truncated".into(),
                        ));
                    }
                    let status = LittleEndian::read_u32(&body[4..8]);
                    if status != 0 {
                        return Err(ProtocolError::BadMessage(format!(
                            "device rejected image: Sahara status 0x{status:08X}"
                        )));
                    }
                    info!("Image transfer complete");
                    return Ok(());
                }
                other => {
                    return Err(ProtocolError::BadMessage(format!(
                        "unexpected Sahara command 0x{other:02X} during image transfer"
                    )));
                }
            }
        }
    }

    /// Tell the device to jump into the freshly uploaded programmer.
    ///
    /// Some boot ROM revisions drop the first Done, so it is retried a
    /// few times before the connection is declared dead.
    #[instrument(skip(self))]
    pub fn start_programmer(&mut self) -> Result<(), ProtocolError> {
        for attempt in 0..3 {
            self.write_packet(CMD_DONE, &[])?;
            match self.read_packet() {
                Ok((CMD_DONE_RESPONSE, _)) => {
                    info!("Programmer started");
                    return Ok(());
                }
                Ok((other, _)) => {
                    return Err(ProtocolError::BadMessage(format!(
                        "expected DoneResponse, got command 0x{other:02X}"
                    )));
                }
                Err(e) => warn!(attempt, error = %e, "Done unanswered, retrying"),
            }
        }
        Err(ProtocolError::BadConnection(
            "device never acknowledged Done".into(),
        ))
    }

    /// Read the OEM root key hashes via the command-mode Execute
    /// exchange. Requires a [`SaharaMode::Command`] handshake.
    #[instrument(skip(self))]
    pub fn read_rkh(&mut self) -> Result<Vec<[u8; RKH_LEN]>, ProtocolError> {
        let mut request = [0u8; 4];
        LittleEndian::write_u32(&mut request, EXEC_OEM_PK_HASH);
        self.write_packet(CMD_EXECUTE, &request)?;

        let (command, body) = self.read_packet()?;
        if command != CMD_EXECUTE_RESPONSE || body.len() < 8 {
            return Err(ProtocolError::BadMessage(format!(
                "expected ExecuteResponse, got command 0x{command:02X} ({} body bytes)",
                body.len()
            )));
        }
        let data_length = LittleEndian::read_u32(&body[4..8]) as usize;
        if data_length == 0 || data_length % RKH_LEN != 0 {
            return Err(ProtocolError::BadMessage(format!(
                "RKH payload of {data_length} bytes is not a multiple of {RKH_LEN}"
            )));
        }

        self.write_packet(CMD_EXECUTE_DATA, &request)?;

        let mut data = Vec::with_capacity(data_length);
        while data.len() < data_length {
            let chunk = self.transport.read(data_length - data.len())?;
            if chunk.is_empty() {
                return Err(ProtocolError::BadConnection(
                    "transport closed during RKH read".into(),
                ));
            }
            data.extend_from_slice(&chunk);
        }

        let hashes = data
            .chunks_exact(RKH_LEN)
            .map(|c| {
                let mut h = [0u8; RKH_LEN];
                h.copy_from_slice(c);
                h
            })
            .collect();
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockTransport;

    fn packet(command: u32, body: &[u8]) -> Vec<u8> {
        let length = (8 + body.len()) as u32;
        let mut p = vec![0u8; 8 + body.len()];
        LittleEndian::write_u32(&mut p[0..4], command);
        LittleEndian::write_u32(&mut p[4..8], length);
        p[8..].copy_from_slice(body);
        p
    }

    fn hello_body() -> Vec<u8> {
        let mut body = vec![0u8; 40];
        LittleEndian::write_u32(&mut body[0..4], PROTOCOL_VERSION);
        LittleEndian::write_u32(&mut body[4..8], 1);
        body
    }

    #[test]
    fn test_handshake_answers_hello() {
        let mock = MockTransport::new();
        mock.queue_read(&packet(CMD_HELLO, &hello_body()));

        let mut client = SaharaClient::new(mock.clone());
        client.handshake(SaharaMode::ImageTransfer).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(LittleEndian::read_u32(&writes[0][0..4]), CMD_HELLO_RESPONSE);
        assert_eq!(writes[0].len(), 48);
        assert_eq!(LittleEndian::read_u32(&writes[0][20..24]), 0); // mode
    }

    #[test]
    fn test_handshake_rejects_unknown_version() {
        let mut body = hello_body();
        LittleEndian::write_u32(&mut body[0..4], 7);
        let mock = MockTransport::new();
        mock.queue_read(&packet(CMD_HELLO, &body));

        let mut client = SaharaClient::new(mock);
        assert!(matches!(
            client.handshake(SaharaMode::ImageTransfer),
            Err(ProtocolError::NotSupported(_))
        ));
    }

    #[test]
    fn test_send_image_serves_requested_ranges() {
        let image: Vec<u8> = (0u8..=255).cycle().take(1024).collect();

        let mut read_data = [0u8; 12];
        LittleEndian::write_u32(&mut read_data[0..4], 13);
        LittleEndian::write_u32(&mut read_data[4..8], 0x100);
        LittleEndian::write_u32(&mut read_data[8..12], 0x80);
        let mut end = [0u8; 8];
        LittleEndian::write_u32(&mut end[0..4], 13);
        LittleEndian::write_u32(&mut end[4..8], 0);

        let mock = MockTransport::new();
        mock.queue_read(&packet(CMD_READ_DATA, &read_data));
        mock.queue_read(&packet(CMD_END_IMAGE_TRANSFER, &end));

        let mut client = SaharaClient::new(mock.clone());
        client.send_image(&image).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], image[0x100..0x180].to_vec());
    }

    #[test]
    fn test_send_image_rejects_failed_transfer() {
        let mut end = [0u8; 8];
        LittleEndian::write_u32(&mut end[0..4], 13);
        LittleEndian::write_u32(&mut end[4..8], 0x22);

        let mock = MockTransport::new();
        mock.queue_read(&packet(CMD_END_IMAGE_TRANSFER, &end));

        let mut client = SaharaClient::new(mock);
        assert!(matches!(
            client.send_image(&[0u8; 64]),
            Err(ProtocolError::BadMessage(_))
        ));
    }

    #[test]
    fn test_start_programmer_retries_done() {
        let mock = MockTransport::new();
        // First Done gets garbage back, second gets the real response.
        mock.queue_read(&[]);
        mock.queue_read(&packet(CMD_DONE_RESPONSE, &[0u8; 8]));

        let mut client = SaharaClient::new(mock.clone());
        client.start_programmer().unwrap();
        assert_eq!(mock.writes().len(), 2);
    }

    #[test]
    fn test_start_programmer_gives_up_after_three_tries() {
        let mock = MockTransport::new();
        let mut client = SaharaClient::new(mock.clone());
        assert!(matches!(
            client.start_programmer(),
            Err(ProtocolError::BadConnection(_))
        ));
        assert_eq!(mock.writes().len(), 3);
    }

    #[test]
    fn test_read_rkh_execute_exchange() {
        let rkh: Vec<u8> = (0u8..32).collect();
        let mut exec_response = [0u8; 8];
        LittleEndian::write_u32(&mut exec_response[0..4], EXEC_OEM_PK_HASH);
        LittleEndian::write_u32(&mut exec_response[4..8], 32);

        let mock = MockTransport::new();
        mock.queue_read(&packet(CMD_HELLO, &hello_body()));
        mock.queue_read(&packet(CMD_EXECUTE_RESPONSE, &exec_response));
        mock.queue_read(&rkh);

        let mut client = SaharaClient::new(mock.clone());
        client.handshake(SaharaMode::Command).unwrap();
        let hashes = client.read_rkh().unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].to_vec(), rkh);

        let writes = mock.writes();
        // HelloResponse, Execute, ExecuteData
        assert_eq!(writes.len(), 3);
        assert_eq!(LittleEndian::read_u32(&writes[1][0..4]), CMD_EXECUTE);
        assert_eq!(LittleEndian::read_u32(&writes[2][0..4]), CMD_EXECUTE_DATA);
    }
}
