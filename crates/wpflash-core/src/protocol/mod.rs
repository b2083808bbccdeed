//! Device wire protocols.
//!
//! Layered engines over one byte-in/byte-out transport seam:
//! [`transport::RawTransport`] is the injected capability, `framing`
//! adds the HDLC-style byte stuffing the legacy serial protocols need,
//! and the per-protocol modules implement the actual state machines
//! (Qualcomm Sahara/Download/Flasher/Firehose, Lumia NOK*).
//!
//! Failure taxonomy: transport faults become [`ProtocolError::BadConnection`],
//! malformed or unexpected responses become [`ProtocolError::BadMessage`].
//! Both end the session; callers reconnect and restart the handshake.

pub mod download;
pub mod firehose;
pub mod flasher;
pub mod framing;
pub mod lumia;
pub mod sahara;
pub mod transport;
pub mod usb;

pub use transport::{MockTransport, RawTransport, TransportError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad message: {0}")]
    BadMessage(String),
    #[error("bad connection: {0}")]
    BadConnection(String),
    #[error("not supported by device: {0}")]
    NotSupported(String),
    #[error("device reported flash error 0x{code:04X}: {message}")]
    Flash { code: u16, message: &'static str },
    #[error("image error: {0}")]
    Image(#[from] crate::ffu::FfuError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for ProtocolError {
    fn from(e: TransportError) -> Self {
        ProtocolError::BadConnection(e.to_string())
    }
}
