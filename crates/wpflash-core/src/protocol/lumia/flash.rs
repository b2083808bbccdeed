//! Secure FFU flashing over the NOKXFS command.
//!
//! Three wire generations exist, advertised by the phone in its
//! protocol mask: the original per-chunk protocol, a buffered variant
//! sized by the phone's write buffer, and a resumable variant that
//! names the chunk index and carries a CRC alongside each chunk. The
//! best mutually supported generation is picked automatically.

use crc32fast::Hasher;
use tracing::{debug, info, instrument};

use super::info::{FFU_PROTOCOL_V2, FFU_PROTOCOL_V3};
use super::LumiaClient;
use crate::events::{FlashEvent, FlashObserver};
use crate::ffu::FfuImage;
use crate::protocol::transport::RawTransport;
use crate::protocol::ProtocolError;

/// Subblocks of the original secure-flash protocol.
const SUB_FFU_HEADER_V1: u8 = 0x0B;
const SUB_FFU_CHUNK_V1: u8 = 0x0C;
/// Buffered protocol: header and payload buffers.
const SUB_FFU_HEADER_V2: u8 = 0x21;
const SUB_FFU_BUFFER_V2: u8 = 0x1B;
/// Resumable protocol: indexed chunk with CRC.
const SUB_FFU_CHUNK_V3: u8 = 0x1D;

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

impl<T: RawTransport> LumiaClient<T> {
    /// Flash a full FFU image onto the device.
    ///
    /// Switches to the flash application first; progress is reported in
    /// payload chunks.
    #[instrument(skip(self, image, observer), fields(platform = image.platform_id()))]
    pub fn flash_ffu(
        &mut self,
        image: &FfuImage,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        self.switch_to_flash_app()?;
        let info = self.read_info()?.clone();

        let phone_platforms = info.platform_id.clone();
        if !phone_platforms.is_empty() && !image.platform_id().is_empty()
            && !phone_platforms.contains(image.platform_id())
        {
            return Err(ProtocolError::NotSupported(format!(
                "image targets platform {:?}, phone reports {:?}",
                image.platform_id(),
                phone_platforms
            )));
        }

        let generation = info.best_ffu_protocol();
        let header = image.header_blob()?;
        let total = image.total_chunk_count();
        info!(
            generation = %format!("V{}", generation.trailing_zeros() + 1),
            chunks = total,
            "Starting secure flash"
        );

        let header_sub = if generation >= FFU_PROTOCOL_V2 {
            SUB_FFU_HEADER_V2
        } else {
            SUB_FFU_HEADER_V1
        };
        self.command(&Self::secure_flash_message(&[(header_sub, header)]))?;

        match generation {
            FFU_PROTOCOL_V3 => self.stream_chunks_v3(image, observer)?,
            FFU_PROTOCOL_V2 => self.stream_buffers_v2(image, &info, observer)?,
            _ => self.stream_chunks_v1(image, observer)?,
        }

        observer.on_event(&FlashEvent::Complete);
        info!("Secure flash complete");
        Ok(())
    }

    fn stream_chunks_v1(
        &mut self,
        image: &FfuImage,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        let total = image.total_chunk_count();
        for index in 0..total {
            let chunk = image.payload_chunk(index)?;
            self.command(&Self::secure_flash_message(&[(SUB_FFU_CHUNK_V1, chunk)]))?;
            observer.on_event(&FlashEvent::Progress {
                operation: "flash-ffu".into(),
                current: (index + 1) as u64,
                total: total as u64,
            });
        }
        Ok(())
    }

    fn stream_buffers_v2(
        &mut self,
        image: &FfuImage,
        info: &super::info::PhoneInfo,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        let chunk_size = image.chunk_size() as usize;
        let chunks_per_buffer = if info.write_buffer_size as usize >= chunk_size {
            info.write_buffer_size as usize / chunk_size
        } else {
            1
        };
        debug!(chunks_per_buffer, "Buffered transfer");

        let total = image.total_chunk_count();
        let mut index = 0u32;
        while index < total {
            let count = chunks_per_buffer.min((total - index) as usize);
            let mut buffer = Vec::with_capacity(count * chunk_size);
            for i in 0..count {
                buffer.extend_from_slice(&image.payload_chunk(index + i as u32)?);
            }
            self.command(&Self::secure_flash_message(&[(SUB_FFU_BUFFER_V2, buffer)]))?;
            index += count as u32;
            observer.on_event(&FlashEvent::Progress {
                operation: "flash-ffu".into(),
                current: index as u64,
                total: total as u64,
            });
        }
        Ok(())
    }

    fn stream_chunks_v3(
        &mut self,
        image: &FfuImage,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        let total = image.total_chunk_count();
        for index in 0..total {
            let chunk = image.payload_chunk(index)?;
            let mut data = Vec::with_capacity(8 + chunk.len());
            data.extend_from_slice(&index.to_be_bytes());
            data.extend_from_slice(&crc32(&chunk).to_be_bytes());
            data.extend_from_slice(&chunk);
            self.command(&Self::secure_flash_message(&[(SUB_FFU_CHUNK_V3, data)]))?;
            observer.on_event(&FlashEvent::Progress {
                operation: "flash-ffu".into(),
                current: (index + 1) as u64,
                total: total as u64,
            });
        }
        Ok(())
    }
}
