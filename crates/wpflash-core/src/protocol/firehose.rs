//! Firehose programmer interface.
//!
//! Once Sahara has started the programmer, the device speaks
//! XML-over-USB. Full device provisioning is driven by a prerecorded
//! emergency-downloader (ED) payload: a capture of host-to-programmer
//! traffic that this module replays, checking the device's ACK/NAK
//! responses as it goes.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use super::transport::RawTransport;
use super::ProtocolError;

const PING: &[u8] = b"<?xml version=\"1.0\" ?><data><nop /></data>";

const CONNECT_ATTEMPTS: usize = 6;
const CONNECT_SEND_TIMEOUT: Duration = Duration::from_millis(200);
const CONNECT_RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Signature of an ED payload file.
const ED_MAGIC: &[u8; 17] = b"Qualcomm Flash ED";
/// Three descriptive text fields follow the magic.
const ED_TEXT_FIELD_LEN: usize = 0x64;
/// Device/programmer info block after the text fields.
const ED_INFO_LEN: usize = 0x670;
const ED_HEADER_LEN: usize = ED_MAGIC.len() + 3 * ED_TEXT_FIELD_LEN + ED_INFO_LEN;
/// Fixed record size; bytes 0..4 hold the data length, 12..16 the tag,
/// 16.. the data itself.
const ED_RECORD_LEN: usize = 0x200;
const ED_RECORD_DATA_OFFSET: usize = 16;

pub struct FirehoseClient<T: RawTransport> {
    transport: T,
    rawmode: bool,
}

impl<T: RawTransport> FirehoseClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            rawmode: false,
        }
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Poke the freshly started programmer until it answers.
    ///
    /// Right after the jump the programmer dumps a serial banner and,
    /// on engineering devices, a signature complaint that clears on a
    /// later attempt; both are drained rather than treated as errors.
    #[instrument(skip(self))]
    pub fn connect_to_programmer(&mut self) -> Result<(), ProtocolError> {
        for attempt in 0..CONNECT_ATTEMPTS {
            self.transport.set_timeout(CONNECT_SEND_TIMEOUT);
            if let Err(e) = self.transport.write(PING) {
                warn!(attempt, error = %e, "Programmer not accepting writes yet");
                continue;
            }

            self.transport.set_timeout(CONNECT_RECV_TIMEOUT);
            loop {
                let response = match self.transport.read(0x1000) {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let text = String::from_utf8_lossy(&response);
                if text.contains("Chip serial num") {
                    debug!("Draining programmer banner");
                    continue;
                }
                if text.contains("Failed to authenticate Digital Signature.") {
                    warn!(attempt, "Programmer signature not accepted yet, retrying");
                    break;
                }
                if text.contains("ACK") {
                    info!(attempt, "Programmer responding");
                    return Ok(());
                }
            }
        }
        Err(ProtocolError::BadConnection(
            "programmer never answered the handshake".into(),
        ))
    }

    fn read_response(&mut self) -> Result<String, ProtocolError> {
        loop {
            let response = self.transport.read(0x1000)?;
            let text = String::from_utf8_lossy(&response).into_owned();
            if text.contains("Chip serial num") {
                continue;
            }
            return Ok(text);
        }
    }

    fn apply_rawmode(&mut self, response: &str) {
        if response.contains("rawmode=\"true\"") {
            self.rawmode = true;
        } else if response.contains("rawmode=\"false\"") {
            self.rawmode = false;
        }
    }

    /// Replay a prerecorded ED payload against the programmer.
    ///
    /// Returns `Ok(false)` when the device answers a checkpoint with
    /// anything but ACK; the payload is aborted at that point and the
    /// caller decides whether to retry with a different payload.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn send_ed_payload(&mut self, payload: &[u8]) -> Result<bool, ProtocolError> {
        if payload.len() < ED_HEADER_LEN || &payload[..ED_MAGIC.len()] != ED_MAGIC {
            return Err(ProtocolError::BadMessage(
                "not an emergency-downloader payload".into(),
            ));
        }

        let mut pending: Vec<u8> = Vec::new();
        let mut offset = ED_HEADER_LEN;

        while offset + ED_RECORD_LEN <= payload.len() {
            let record = &payload[offset..offset + ED_RECORD_LEN];
            offset += ED_RECORD_LEN;

            let data_len = LittleEndian::read_u32(&record[0..4]) as usize;
            if data_len > ED_RECORD_LEN - ED_RECORD_DATA_OFFSET {
                return Err(ProtocolError::BadMessage(format!(
                    "ED record claims {data_len} data bytes"
                )));
            }
            let tag = String::from_utf8_lossy(&record[12..16]).into_owned();
            let data = &record[ED_RECORD_DATA_OFFSET..ED_RECORD_DATA_OFFSET + data_len];

            if !tag.starts_with("MSG") {
                pending.extend_from_slice(data);
                continue;
            }

            // Checkpoint record: flush what we buffered, then honor the
            // reply expectation encoded in the record data. The flag
            // tracked from prior responses decides whether the wire
            // expects a command or raw data right now; a recording
            // that disagrees is aborted, not replayed.
            if !pending.is_empty() {
                let is_command = pending.starts_with(b"<?xml") || pending.starts_with(b"<");
                if self.rawmode == is_command {
                    warn!(
                        %tag,
                        rawmode = self.rawmode,
                        "Recording disagrees with the programmer's transfer mode"
                    );
                    return Ok(false);
                }
                self.transport.write(&pending)?;
                pending.clear();
            }

            let expectation = String::from_utf8_lossy(data).into_owned();
            debug!(%tag, %expectation, "ED checkpoint");

            if expectation.contains("DATA_ALL") {
                // Device streams data back; drain without interpreting.
                while let Ok(chunk) = self.transport.read(0x1000) {
                    if chunk.is_empty() {
                        break;
                    }
                }
                continue;
            }
            if expectation.contains("RAW_DATA") {
                // The reply to a raw transfer flips the mode back.
                let response = self.read_response()?;
                self.apply_rawmode(&response);
                continue;
            }
            if expectation.contains("XML") || expectation.contains("LAST") {
                let response = self.read_response()?;
                self.apply_rawmode(&response);
                if !response.contains("ACK") {
                    warn!(%tag, response = %response.trim(), "Device rejected ED checkpoint");
                    return Ok(false);
                }
                if expectation.contains("LAST") {
                    info!("ED payload complete");
                    return Ok(true);
                }
            }
        }

        if !pending.is_empty() {
            self.transport.write(&pending)?;
        }
        Ok(true)
    }

    pub fn rawmode(&self) -> bool {
        self.rawmode
    }
}
