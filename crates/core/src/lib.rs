//! # cartflash-core
//!
//! Protocol core for a cartridge-flashing peripheral (v0.4.1).
//!
//! Talks to the flasher over a 115,200 baud serial link to read, erase,
//! write, and verify Game-Boy-compatible cartridges: ROM flash behind a
//! 16 KiB banking window and 32 KiB of battery-backed FRAM save memory.
//! Also ships the IPS patch codec used to transform extracted ROM images.
//!
//! ## Architecture
//!
//! - [`wire`] — Fixed 4-byte command / 3-byte reply frame codec
//! - [`transport`] — Serial link plus the [`transport::Transport`] trait
//! - [`session`] — Background reader, per-command-tag reply queues, fault channel
//! - [`bank`] — Logical (block, offset) addresses and ROM bank switching
//! - [`flash`] — Chip identification, sector/chip erase, verified bank transfer
//! - [`fram`] — Save memory banking, presence probe, full read/write
//! - [`cartridge`] — Whole-ROM workflows, retry policy, per-title save layouts
//! - [`ips`] — IPS patch create/apply/load/encode
//!
//! ## Correlation model
//!
//! The device answers commands of a given type strictly in send order, so
//! replies carry no request identifier; the session demultiplexes them into
//! one FIFO queue per command tag. A caller registers a listener for a tag,
//! sends a burst, drains exactly that many replies, and unregisters. Two
//! operations must never wait on the same tag at once; the session enforces
//! this by refusing a second listener.
//!
//! Every blocking wait carries an explicit timeout. Transport faults from
//! the background reader surface on a session-wide fault channel that
//! long-running loops poll between banks.

pub mod bank;
pub mod cartridge;
pub mod error;
pub mod flash;
pub mod fram;
pub mod ips;
pub mod session;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod mockdev;

pub use bank::{CartAddr, BANK_SIZE, BLOCKS_PER_BANK, BLOCK_SIZE, MAX_BANKS, MAX_CART_SIZE};
pub use cartridge::{Monitor, SaveLayout, SaveSettings};
pub use error::Error;
pub use flash::FlashChipInfo;
pub use fram::FRAM_SIZE;
pub use ips::{IpsError, Patch, PatchRecord};
pub use session::Session;
pub use transport::{SerialTransport, Transport, BAUD_RATE};
