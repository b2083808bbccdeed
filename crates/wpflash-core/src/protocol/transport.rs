//! Transport layer abstraction.
//!
//! The protocol engines only need a byte pipe with a timeout knob;
//! everything device-specific (USB enumeration, endpoints, serial port
//! selection) stays behind this trait.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract raw transport.
///
/// One session owns one transport; request/response exchanges are
/// never interleaved, which is why the methods take `&mut self`.
pub trait RawTransport: Send {
    /// Write raw bytes to the device.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `max_len` raw bytes; an empty device queue past the
    /// current timeout is a [`TransportError::Timeout`].
    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Adjust the read/write timeout for subsequent operations.
    fn set_timeout(&mut self, timeout: Duration);
}

#[derive(Default)]
struct MockState {
    read_queue: VecDeque<Vec<u8>>,
    write_log: Vec<Vec<u8>>,
    connected: bool,
    timeout: Duration,
}

/// Mock transport for protocol state-machine tests: scripted reads,
/// captured writes, simulated disconnect. Clones share state so a test
/// can keep a handle while the engine owns another.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                timeout: Duration::from_millis(5000),
                ..MockState::default()
            })),
        }
    }

    /// Queue a response returned by the next unanswered read.
    pub fn queue_read(&self, data: &[u8]) {
        self.state.lock().unwrap().read_queue.push_back(data.to_vec());
    }

    /// All captured writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().write_log.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().write_log.clear();
    }

    /// Simulate a device disconnect; subsequent I/O fails.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    pub fn timeout(&self) -> Duration {
        self.state.lock().unwrap().timeout
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.write_log.push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let timeout_ms = state.timeout.as_millis() as u64;
        state
            .read_queue
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms })
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.state.lock().unwrap().timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_scripted_reads() {
        let mock = MockTransport::new();
        mock.queue_read(b"first");
        mock.queue_read(b"second");

        let mut handle = mock.clone();
        assert_eq!(handle.read(512).unwrap(), b"first");
        assert_eq!(handle.read(512).unwrap(), b"second");
        assert!(matches!(
            handle.read(512),
            Err(TransportError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_write_capture_and_disconnect() {
        let mock = MockTransport::new();
        let mut handle = mock.clone();
        handle.write(b"hello").unwrap();
        assert_eq!(mock.writes(), vec![b"hello".to_vec()]);

        mock.disconnect();
        assert!(matches!(
            handle.write(b"x"),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_mock_timeout_tracks_set_timeout() {
        let mock = MockTransport::new();
        let mut handle = mock.clone();
        handle.set_timeout(Duration::from_millis(200));
        assert_eq!(mock.timeout(), Duration::from_millis(200));
        assert!(matches!(
            handle.read(512),
            Err(TransportError::Timeout { timeout_ms: 200 })
        ));
    }
}
