//! Error type for cartridge protocol operations.
//!
//! Every failure mode a caller must react to differently gets its own
//! variant. Verification failures distinguish address echoes from data
//! echoes, timeouts carry the operation that expired, and configuration
//! problems are reported before any I/O happens. The IPS codec has its own
//! [`crate::ips::IpsError`] since it never touches the device.

use std::fmt;
use std::io;

/// Errors reported by the session, flash, FRAM, and orchestration layers.
#[derive(Debug)]
pub enum Error {
    /// Serial transport failure. May be reported asynchronously through the
    /// session fault channel when the background reader hits it.
    Io(io::Error),
    /// A bounded wait for a device reply expired.
    Timeout { op: &'static str },
    /// A listener queue for this command tag is already registered.
    /// Replies are correlated by command type only, so two operations must
    /// never wait on the same tag at once.
    ListenerBusy { tag: u8 },
    /// The session I/O thread has shut down and no longer accepts commands.
    SessionClosed,
    /// A reply frame did not carry the payload its tag promises.
    Protocol(&'static str),
    /// The device echoed a different address than the one written.
    AddressMismatch { bank: u16, expect: u16, got: u16 },
    /// The device echoed a different data byte than the one written.
    DataMismatch { bank: u16, addr: u16, expect: u8, got: u8 },
    /// Flash identification bytes matched no chip in the known table.
    UnknownChip { id: [u8; 8] },
    /// A buffer length does not match the exact required size.
    BadLength { expect: usize, got: usize },
    /// A ROM image length is not a whole number of banks.
    NotBankAligned { len: usize },
    /// The chip's sector size does not divide into whole banks.
    Cadence { sector_kb: u32 },
    /// The ROM image does not fit the detected chip.
    RomTooLarge { rom: usize, chip: usize },
    /// No cartridge is present in the device slot.
    NoCartridge,
    /// The cartridge was removed while a transfer was in progress.
    CartridgeRemoved,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "transport I/O error: {}", e),
            Error::Timeout { op } => write!(f, "timed out waiting for reply during {}", op),
            Error::ListenerBusy { tag } => {
                write!(f, "a listener for command tag 0x{:02X} is already registered", tag)
            }
            Error::SessionClosed => write!(f, "session is closed"),
            Error::Protocol(what) => write!(f, "malformed {} reply", what),
            Error::AddressMismatch { bank, expect, got } => write!(
                f,
                "address mismatch in bank {}: wrote 0x{:04X}, device echoed 0x{:04X}",
                bank, expect, got
            ),
            Error::DataMismatch { bank, addr, expect, got } => write!(
                f,
                "data mismatch in bank {} at offset 0x{:04X}: wrote 0x{:02X}, device echoed 0x{:02X}",
                bank, addr, expect, got
            ),
            Error::UnknownChip { id } => write!(
                f,
                "unsupported flash chip (id {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X})",
                id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7]
            ),
            Error::BadLength { expect, got } => {
                write!(f, "buffer is {} bytes, expected exactly {}", got, expect)
            }
            Error::NotBankAligned { len } => {
                write!(f, "ROM image of {} bytes is not a whole number of banks", len)
            }
            Error::Cadence { sector_kb } => write!(
                f,
                "sector size of {} KiB does not divide into whole banks",
                sector_kb
            ),
            Error::RomTooLarge { rom, chip } => {
                write!(f, "ROM image of {} bytes exceeds chip capacity of {} bytes", rom, chip)
            }
            Error::NoCartridge => write!(f, "no cartridge detected"),
            Error::CartridgeRemoved => write!(f, "cartridge removed during transfer"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
