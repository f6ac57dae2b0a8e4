//! Byte transport to the flashing device.
//!
//! The physical link is a serial connection at a fixed 115,200 baud, 8N1.
//! [`Transport`] abstracts it so the session can run against an in-memory
//! device double in tests. `recv` uses a short poll timeout: a
//! `TimedOut`/`WouldBlock` error means "no bytes yet", which lets the
//! session I/O thread interleave outgoing writes with the read loop without
//! ever parking on the port.

use std::io;
use std::time::Duration;

use serial::prelude::*;

use crate::error::Error;

/// Fixed link speed of the device.
pub const BAUD_RATE: usize = 115_200;

/// Poll granularity of the background read loop.
const READ_POLL: Duration = Duration::from_millis(100);

/// A byte pipe to the device. Implementations are moved into the session's
/// background I/O thread, so they must be `Send`.
pub trait Transport: Send {
    /// Write encoded command frames to the device.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever reply bytes are available into `buf`, returning the
    /// count. A `TimedOut` or `WouldBlock` error kind means no data arrived
    /// within the poll window and is not a fault.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// [`Transport`] over a system serial port.
pub struct SerialTransport {
    port: serial::SystemPort,
}

impl SerialTransport {
    /// Open and configure the serial device at `path` (115,200 8N1, no
    /// flow control).
    pub fn open(path: &str) -> Result<SerialTransport, Error> {
        let mut port = serial::open(path).map_err(io::Error::from)?;
        port.configure(&serial::PortSettings {
            baud_rate: serial::BaudRate::from_speed(BAUD_RATE),
            char_size: serial::Bits8,
            parity: serial::ParityNone,
            stop_bits: serial::Stop1,
            flow_control: serial::FlowNone,
        })
        .map_err(io::Error::from)?;
        port.set_timeout(READ_POLL).map_err(io::Error::from)?;
        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.port.read(buf)
    }
}
