//! [`SerialLink`] – byte-level connection to the robot board.
//!
//! The event dispatcher polls a link once per tick, so reads must never
//! block: [`SerialLink::read_available`] returns whatever is waiting (often
//! nothing) and lets the frame buffer deal with partial lines.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use robohub_types::HubError;
use tracing::info;

/// Baud rate of the reference board firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A bidirectional byte link to the hardware.
pub trait SerialLink: Send {
    /// Bytes received since the last call.  Returns an empty vector when
    /// nothing is waiting.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;

    /// Write one complete outbound frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// Physical port
// ---------------------------------------------------------------------------

/// A real serial device opened through the `serialport` crate.
pub struct SerialPortLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialPortLink {
    /// Open `path` (e.g. `/dev/ttyUSB0` or `COM3`).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Io`] when the device cannot be opened.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, HubError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(io::Error::from)?;
        info!(path, baud_rate, "serial link opened");
        Ok(Self { port })
    }
}

impl SerialLink for SerialPortLink {
    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let waiting = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; waiting];
        let n = self.port.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }
}

// ---------------------------------------------------------------------------
// In-memory link
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryLinkState {
    inbound: Vec<u8>,
    written: Vec<Vec<u8>>,
}

/// In-process stand-in for a board.  Clones share the same buffers, so a
/// test can keep one clone to feed bytes and inspect written frames while
/// the dispatcher owns the other.
#[derive(Clone, Debug, Default)]
pub struct MemoryLink {
    state: Arc<Mutex<MemoryLinkState>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes as if the board had sent them.
    pub fn feed(&self, bytes: &[u8]) {
        self.lock().inbound.extend_from_slice(bytes);
    }

    /// Every frame written so far, oldest first.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SerialLink for MemoryLink {
    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.lock().inbound))
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.lock().written.push(frame.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_link_returns_fed_bytes_once() {
        let feeder = MemoryLink::new();
        let mut link = feeder.clone();
        assert!(link.read_available().unwrap().is_empty());

        feeder.feed(b"abc");
        feeder.feed(b"\n");
        assert_eq!(link.read_available().unwrap(), b"abc\n");
        assert!(link.read_available().unwrap().is_empty());
    }

    #[test]
    fn memory_link_records_writes() {
        let observer = MemoryLink::new();
        let mut link = observer.clone();
        link.write_frame(b"90,0\n").unwrap();
        link.write_frame(b"90,45\n").unwrap();
        assert_eq!(
            observer.written(),
            vec![b"90,0\n".to_vec(), b"90,45\n".to_vec()]
        );
    }

    #[test]
    fn opening_a_missing_port_fails() {
        let res = SerialPortLink::open("/dev/robohub-does-not-exist", DEFAULT_BAUD_RATE);
        assert!(matches!(res, Err(HubError::Io(_))));
    }
}
