//! Legacy DLOAD protocol (emergency download over the framed serial
//! link, USB PID 9006).
//!
//! Used to push a flash programmer into device RAM and jump to it.
//! Multi-byte fields are big-endian, unlike every other protocol in
//! this stack.

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, instrument};

use super::framing::FramedTransport;
use super::transport::RawTransport;
use super::ProtocolError;

const CMD_ACK: u8 = 0x02;
const CMD_GO: u8 = 0x05;
const CMD_NOP: u8 = 0x06;
const CMD_RESET: u8 = 0x0A;
const CMD_WRITE_32: u8 = 0x0F;
const CMD_GET_RKH: u8 = 0x18;

/// Payload bytes per write packet.
const WRITE_CHUNK: usize = 0x100;

const RKH_LEN: usize = 32;

pub struct DloadClient<T: RawTransport> {
    transport: FramedTransport<T>,
}

impl<T: RawTransport> DloadClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: FramedTransport::new(transport),
        }
    }

    pub fn into_transport(self) -> T {
        self.transport.into_inner()
    }

    fn expect_ack(&mut self, context: &str) -> Result<(), ProtocolError> {
        let response = self.transport.receive()?;
        match response.first() {
            Some(&CMD_ACK) => Ok(()),
            Some(&code) => Err(ProtocolError::BadMessage(format!(
                "{context}: expected ack, got command 0x{code:02X}"
            ))),
            None => Err(ProtocolError::BadMessage(format!(
                "{context}: empty response"
            ))),
        }
    }

    /// Probe whether a DLOAD listener is on the other end.
    #[instrument(skip(self))]
    pub fn is_alive(&mut self) -> bool {
        if self.transport.send(&[CMD_NOP]).is_err() {
            return false;
        }
        self.expect_ack("nop").is_ok()
    }

    /// Upload `data` to device memory at `address`.
    #[instrument(skip(self, data), fields(address = format!("0x{address:08X}"), len = data.len()))]
    pub fn send_to_memory(&mut self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = &data[offset..data.len().min(offset + WRITE_CHUNK)];
            let mut packet = vec![0u8; 7 + chunk.len()];
            packet[0] = CMD_WRITE_32;
            BigEndian::write_u32(&mut packet[1..5], address + offset as u32);
            BigEndian::write_u16(&mut packet[5..7], chunk.len() as u16);
            packet[7..].copy_from_slice(chunk);

            self.transport.send(&packet)?;
            self.expect_ack("write")?;
            offset += chunk.len();
        }
        debug!(bytes = data.len(), "Upload complete");
        Ok(())
    }

    /// Jump to the uploaded code. The device leaves DLOAD mode; no
    /// response follows.
    #[instrument(skip(self))]
    pub fn start_bootloader(&mut self, address: u32) -> Result<(), ProtocolError> {
        let mut packet = [0u8; 5];
        packet[0] = CMD_GO;
        BigEndian::write_u32(&mut packet[1..5], address);
        self.transport.send(&packet)?;
        info!(address = %format!("0x{address:08X}"), "Bootloader started");
        Ok(())
    }

    /// Reset the device.
    #[instrument(skip(self))]
    pub fn reset(&mut self) -> Result<(), ProtocolError> {
        self.transport.send(&[CMD_RESET])?;
        self.expect_ack("reset")
    }

    /// Read the root key hash burned into the SoC.
    #[instrument(skip(self))]
    pub fn read_rkh(&mut self) -> Result<[u8; RKH_LEN], ProtocolError> {
        self.transport.send(&[CMD_GET_RKH])?;
        let response = self.transport.receive()?;
        if response.len() < 1 + RKH_LEN || response[0] != CMD_GET_RKH {
            return Err(ProtocolError::BadMessage(format!(
                "bad RKH response: {} bytes, command 0x{:02X}",
                response.len(),
                response.first().copied().unwrap_or(0)
            )));
        }
        let mut rkh = [0u8; RKH_LEN];
        rkh.copy_from_slice(&response[1..1 + RKH_LEN]);
        Ok(rkh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::encode;
    use crate::protocol::MockTransport;
    use crate::protocol::framing;

    fn decode_frame(frame: &[u8]) -> Vec<u8> {
        framing::decode(frame).unwrap().0
    }

    #[test]
    fn test_is_alive_nop_ack() {
        let mock = MockTransport::new();
        mock.queue_read(&encode(&[CMD_ACK]));

        let mut client = DloadClient::new(mock.clone());
        assert!(client.is_alive());
        assert_eq!(decode_frame(&mock.writes()[0]), vec![CMD_NOP]);
    }

    #[test]
    fn test_is_alive_false_on_timeout() {
        let mut client = DloadClient::new(MockTransport::new());
        assert!(!client.is_alive());
    }

    #[test]
    fn test_send_to_memory_chunks_and_addresses() {
        let data = vec![0x5Au8; WRITE_CHUNK + 0x20];
        let mock = MockTransport::new();
        mock.queue_read(&encode(&[CMD_ACK]));
        mock.queue_read(&encode(&[CMD_ACK]));

        let mut client = DloadClient::new(mock.clone());
        client.send_to_memory(0x2A00_0000, &data).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);

        let first = decode_frame(&writes[0]);
        assert_eq!(first[0], CMD_WRITE_32);
        assert_eq!(BigEndian::read_u32(&first[1..5]), 0x2A00_0000);
        assert_eq!(BigEndian::read_u16(&first[5..7]) as usize, WRITE_CHUNK);
        assert_eq!(first.len(), 7 + WRITE_CHUNK);

        let second = decode_frame(&writes[1]);
        assert_eq!(
            BigEndian::read_u32(&second[1..5]) as usize,
            0x2A00_0000 + WRITE_CHUNK
        );
        assert_eq!(BigEndian::read_u16(&second[5..7]), 0x20);
    }

    #[test]
    fn test_write_rejected_without_ack() {
        let mock = MockTransport::new();
        mock.queue_read(&encode(&[0x0D, 0x01])); // error response

        let mut client = DloadClient::new(mock);
        assert!(matches!(
            client.send_to_memory(0, &[1, 2, 3]),
            Err(ProtocolError::BadMessage(_))
        ));
    }

    #[test]
    fn test_read_rkh() {
        let rkh: Vec<u8> = (100u8..132).collect();
        let mut response = vec![CMD_GET_RKH];
        response.extend_from_slice(&rkh);

        let mock = MockTransport::new();
        mock.queue_read(&encode(&response));

        let mut client = DloadClient::new(mock);
        assert_eq!(client.read_rkh().unwrap().to_vec(), rkh);
    }

    #[test]
    fn test_start_bootloader_sends_go() {
        let mock = MockTransport::new();
        let mut client = DloadClient::new(mock.clone());
        client.start_bootloader(0x1234_5678).unwrap();

        let go = decode_frame(&mock.writes()[0]);
        assert_eq!(go[0], CMD_GO);
        assert_eq!(BigEndian::read_u32(&go[1..5]), 0x1234_5678);
    }
}
