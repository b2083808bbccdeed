//! Streaming-download flasher protocol, spoken by the programmer that
//! DLOAD uploads into RAM.
//!
//! Same framed link as DLOAD but little-endian fields and a stream
//! write command whose per-chunk acknowledgement echoes the address.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument};

use super::framing::FramedTransport;
use super::transport::RawTransport;
use super::ProtocolError;
use crate::events::{FlashEvent, FlashObserver};

const CMD_HELLO: u8 = 0x01;
const CMD_HELLO_RESPONSE: u8 = 0x02;
const CMD_STREAM_WRITE: u8 = 0x07;
const CMD_WRITE_ACK: u8 = 0x08;
const CMD_CLOSE: u8 = 0x15;
const CMD_CLOSE_ACK: u8 = 0x16;
const CMD_OPEN_MULTI: u8 = 0x1B;
const CMD_OPEN_MULTI_ACK: u8 = 0x1C;

/// Fixed-width identification field of the hello packet; the magic
/// string is NUL-padded to fill it.
const HELLO_IDENTIFICATION: [u8; 34] = *b"QCOM fast download protocol host\0\0";
const PROTOCOL_VERSION: u8 = 0x02;

/// Payload bytes per stream write.
const FLASH_CHUNK: usize = 0x400;

pub struct FlasherClient<T: RawTransport> {
    transport: FramedTransport<T>,
}

impl<T: RawTransport> FlasherClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: FramedTransport::new(transport),
        }
    }

    pub fn into_transport(self) -> T {
        self.transport.into_inner()
    }

    /// Greet the programmer and verify it answers as one.
    #[instrument(skip(self))]
    pub fn hello(&mut self) -> Result<(), ProtocolError> {
        let mut packet = Vec::with_capacity(2 + HELLO_IDENTIFICATION.len());
        packet.push(CMD_HELLO);
        packet.extend_from_slice(&HELLO_IDENTIFICATION);
        packet.push(PROTOCOL_VERSION);
        self.transport.send(&packet)?;

        let response = self.transport.receive()?;
        if response.first() != Some(&CMD_HELLO_RESPONSE) {
            return Err(ProtocolError::BadMessage(format!(
                "flasher hello rejected: command 0x{:02X}",
                response.first().copied().unwrap_or(0)
            )));
        }
        info!("Flasher greeted");
        Ok(())
    }

    /// Open the target for multi-image writes.
    #[instrument(skip(self))]
    pub fn open_partition(&mut self, mode: u8) -> Result<(), ProtocolError> {
        self.transport.send(&[CMD_OPEN_MULTI, mode])?;
        let response = self.transport.receive()?;
        if response.first() != Some(&CMD_OPEN_MULTI_ACK) {
            return Err(ProtocolError::BadMessage(format!(
                "open rejected: command 0x{:02X}",
                response.first().copied().unwrap_or(0)
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn close_partition(&mut self) -> Result<(), ProtocolError> {
        self.transport.send(&[CMD_CLOSE])?;
        let response = self.transport.receive()?;
        if response.first() != Some(&CMD_CLOSE_ACK) {
            return Err(ProtocolError::BadMessage(format!(
                "close rejected: command 0x{:02X}",
                response.first().copied().unwrap_or(0)
            )));
        }
        Ok(())
    }

    /// Stream `data` to flash starting at `address`.
    ///
    /// Every chunk is individually acknowledged with the address echoed
    /// back; a mismatch means the device lost position and the session
    /// is unusable.
    #[instrument(skip(self, data, observer), fields(address = format!("0x{address:08X}"), len = data.len()))]
    pub fn flash(
        &mut self,
        address: u32,
        data: &[u8],
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = &data[offset..data.len().min(offset + FLASH_CHUNK)];
            let chunk_address = address + offset as u32;

            let mut packet = vec![0u8; 5 + chunk.len()];
            packet[0] = CMD_STREAM_WRITE;
            LittleEndian::write_u32(&mut packet[1..5], chunk_address);
            packet[5..].copy_from_slice(chunk);
            self.transport.send(&packet)?;

            let response = self.transport.receive()?;
            if response.len() < 5 || response[0] != CMD_WRITE_ACK {
                return Err(ProtocolError::BadMessage(format!(
                    "write not acknowledged: command 0x{:02X}",
                    response.first().copied().unwrap_or(0)
                )));
            }
            let echoed = LittleEndian::read_u32(&response[1..5]);
            if echoed != chunk_address {
                return Err(ProtocolError::BadMessage(format!(
                    "device lost position: wrote 0x{chunk_address:08X}, acknowledged 0x{echoed:08X}"
                )));
            }

            offset += chunk.len();
            observer.on_event(&FlashEvent::Progress {
                operation: "flash".into(),
                current: offset as u64,
                total: data.len() as u64,
            });
        }
        debug!(bytes = data.len(), "Flash stream complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::protocol::framing::{self, encode};
    use crate::protocol::MockTransport;

    fn write_ack(address: u32) -> Vec<u8> {
        let mut ack = [0u8; 5];
        ack[0] = CMD_WRITE_ACK;
        LittleEndian::write_u32(&mut ack[1..5], address);
        encode(&ack)
    }

    #[test]
    fn test_hello_exchange() {
        let mock = MockTransport::new();
        mock.queue_read(&encode(&[CMD_HELLO_RESPONSE, 0x02]));

        let mut client = FlasherClient::new(mock.clone());
        client.hello().unwrap();

        let sent = framing::decode(&mock.writes()[0]).unwrap().0;
        assert_eq!(sent.len(), 36);
        assert_eq!(sent[0], CMD_HELLO);
        assert_eq!(sent[1..35], HELLO_IDENTIFICATION);
        assert_eq!(sent[35], PROTOCOL_VERSION);
    }

    #[test]
    fn test_flash_chunks_with_echoed_addresses() {
        let data = vec![0xA5u8; FLASH_CHUNK + 0x10];
        let mock = MockTransport::new();
        mock.queue_read(&write_ack(0x0010_0000));
        mock.queue_read(&write_ack(0x0010_0000 + FLASH_CHUNK as u32));

        let mut client = FlasherClient::new(mock.clone());
        client.flash(0x0010_0000, &data, &NullObserver).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        let first = framing::decode(&writes[0]).unwrap().0;
        assert_eq!(first[0], CMD_STREAM_WRITE);
        assert_eq!(LittleEndian::read_u32(&first[1..5]), 0x0010_0000);
        assert_eq!(first.len(), 5 + FLASH_CHUNK);
    }

    #[test]
    fn test_flash_rejects_wrong_echoed_address() {
        let mock = MockTransport::new();
        mock.queue_read(&write_ack(0xDEAD_0000));

        let mut client = FlasherClient::new(mock);
        let err = client.flash(0x0010_0000, &[0u8; 16], &NullObserver);
        assert!(matches!(err, Err(ProtocolError::BadMessage(_))));
    }

    #[test]
    fn test_open_close_partition() {
        let mock = MockTransport::new();
        mock.queue_read(&encode(&[CMD_OPEN_MULTI_ACK]));
        mock.queue_read(&encode(&[CMD_CLOSE_ACK]));

        let mut client = FlasherClient::new(mock.clone());
        client.open_partition(0x21).unwrap();
        client.close_partition().unwrap();

        let open = framing::decode(&mock.writes()[0]).unwrap().0;
        assert_eq!(open, vec![CMD_OPEN_MULTI, 0x21]);
    }
}
