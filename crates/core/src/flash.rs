//! Flash chip identification, erase, and bank transfer.
//!
//! The chips behind the cartridge bus speak the classic JEDEC command set:
//! a three-write unlock handshake at fixed addresses enters identification
//! mode, starts an erase, or resets the part back to read mode. Writes to
//! flash cells go through the dedicated flash-byte-write command, which
//! makes the device poll the chip for program completion and echo back the
//! byte the cell actually holds, so every bank write is verified byte for
//! byte from the replies alone.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::bank::{switch_bank, CartAddr, BANK_SIZE, BLOCKS_PER_BANK, BLOCK_SIZE};
use crate::error::Error;
use crate::session::{Session, REPLY_TIMEOUT};
use crate::wire::{Command, TAG_READ_BYTE, TAG_WRITE_BYTE, TAG_WRITE_FLASH_BYTE};

/// First unlock handshake address.
const UNLOCK_ADDR1: u16 = 0x0AAA;
/// Second unlock handshake address.
const UNLOCK_ADDR2: u16 = 0x0555;
const UNLOCK_BYTE1: u8 = 0xAA;
const UNLOCK_BYTE2: u8 = 0x55;

/// Handshake command bytes.
const CMD_IDENTIFY: u8 = 0x90;
const CMD_RESET: u8 = 0xF0;
const CMD_ERASE_SECTOR: u8 = 0x30;
const CMD_ERASE_CHIP: u8 = 0x10;

/// An erased flash cell reads back as all ones.
const ERASED: u8 = 0xFF;
/// Identification readout length.
const ID_LEN: usize = 32;
/// Boot-sector chips erase their first sector in sub-units of this size.
const BOOT_SUB_SECTOR: usize = 8 * 1024;

/// Handshake acknowledgements must arrive within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Completion bounds for the two erase shapes.
const ERASE_SECTOR_TIMEOUT: Duration = Duration::from_secs(10);
const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(100);
/// Delay between erase-completion polls.
const ERASE_POLL_DELAY: Duration = Duration::from_millis(25);

/// Immutable descriptor of a supported flash chip.
#[derive(Debug)]
pub struct FlashChipInfo {
    pub vendor: &'static str,
    pub part: &'static str,
    pub total_size_kb: u32,
    pub sector_size_kb: u32,
    /// Sub-sector erases needed for the first sector (1 = uniform part).
    pub erase_group: u8,
    /// Offset added to the erase target when polling for completion.
    pub recovery_offset: u16,
    /// Fixed-offset signature bytes in the identification readout.
    signature: [(usize, u8); 4],
}

impl FlashChipInfo {
    fn matches(&self, id: &[u8; ID_LEN]) -> bool {
        self.signature.iter().all(|&(offset, byte)| id[offset] == byte)
    }
}

/// Every chip the device is known to drive. An identification readout that
/// matches none of these is a terminal detection failure, not a default.
pub static KNOWN_CHIPS: [FlashChipInfo; 4] = [
    FlashChipInfo {
        vendor: "Infineon",
        part: "S29GL032",
        total_size_kb: 4096,
        sector_size_kb: 64,
        erase_group: 1,
        recovery_offset: 0,
        signature: [(0, 0x01), (2, 0x53), (4, 0x00), (6, 0x02)],
    },
    FlashChipInfo {
        vendor: "Macronix",
        part: "MX29LV320EB",
        total_size_kb: 4096,
        sector_size_kb: 64,
        // Bottom-boot part: the first sector only erases as eight 8 KiB
        // sub-sectors.
        erase_group: 8,
        recovery_offset: 0,
        signature: [(0, 0xC2), (2, 0xA8), (4, 0x00), (6, 0x01)],
    },
    FlashChipInfo {
        vendor: "SST",
        part: "SST39VF1682",
        total_size_kb: 2048,
        sector_size_kb: 16,
        erase_group: 1,
        recovery_offset: 2,
        signature: [(0, 0xBF), (2, 0xC8), (4, 0x00), (6, 0x01)],
    },
    FlashChipInfo {
        vendor: "ISSI",
        part: "IS29GL064",
        total_size_kb: 8192,
        sector_size_kb: 64,
        erase_group: 1,
        recovery_offset: 0,
        signature: [(0, 0x9D), (2, 0x7E), (4, 0x10), (6, 0x00)],
    },
];

/// Banks between sector erases for `chip`.
///
/// A sector size that does not divide into whole banks is a configuration
/// error, reported before any I/O begins.
pub fn erase_cadence(chip: &FlashChipInfo) -> Result<u32, Error> {
    let bank_kb = (BANK_SIZE / 1024) as u32;
    if chip.sector_size_kb % bank_kb != 0 {
        return Err(Error::Cadence { sector_kb: chip.sector_size_kb });
    }
    Ok(chip.sector_size_kb / bank_kb)
}

/// Number of banks on `chip`.
pub fn total_banks(chip: &FlashChipInfo) -> usize {
    chip.total_size_kb as usize * 1024 / BANK_SIZE
}

fn write_byte_cmd(raw: u16, value: u8) -> Command {
    Command::WriteByte { addr: CartAddr::from_raw(raw), value }
}

/// Send the three-write handshake whose final write is `value` at `target`,
/// draining all three acknowledgements.
fn handshake(session: &Session, target: CartAddr, value: u8, op: &'static str) -> Result<(), Error> {
    let listener = session.listen(TAG_WRITE_BYTE)?;
    session.send(&[
        write_byte_cmd(UNLOCK_ADDR1, UNLOCK_BYTE1),
        write_byte_cmd(UNLOCK_ADDR2, UNLOCK_BYTE2),
        Command::WriteByte { addr: target, value },
    ])?;
    for _ in 0..3 {
        listener.recv(HANDSHAKE_TIMEOUT, op)?;
    }
    Ok(())
}

/// Identify the flash chip behind the cartridge bus.
///
/// Enters identification mode, reads the 32-byte signature window, resets
/// the chip back to read mode, and only then matches the captured bytes
/// against [`KNOWN_CHIPS`].
pub fn get_flash_type(session: &Session) -> Result<&'static FlashChipInfo, Error> {
    switch_bank(session, 0)?;
    handshake(session, CartAddr::from_raw(UNLOCK_ADDR1), CMD_IDENTIFY, "flash identify")?;

    let mut id = [0u8; ID_LEN];
    {
        let listener = session.listen(TAG_READ_BYTE)?;
        let reads: Vec<Command> = (0..ID_LEN)
            .map(|i| Command::ReadByte { addr: CartAddr::from_raw(i as u16) })
            .collect();
        session.send(&reads)?;
        for _ in 0..ID_LEN {
            let reply = listener.recv(HANDSHAKE_TIMEOUT, "flash identify")?;
            let (offset, value) = reply.byte_echo().ok_or(Error::Protocol("identify read"))?;
            if let Some(slot) = id.get_mut(offset as usize) {
                *slot = value;
            }
        }
    }

    handshake(session, CartAddr::from_raw(UNLOCK_ADDR1), CMD_RESET, "flash reset")?;

    for chip in KNOWN_CHIPS.iter() {
        if chip.matches(&id) {
            info!(
                "detected {} {} ({} KiB, {} KiB sectors)",
                chip.vendor, chip.part, chip.total_size_kb, chip.sector_size_kb
            );
            return Ok(chip);
        }
    }
    let mut head = [0u8; 8];
    head.copy_from_slice(&id[..8]);
    Err(Error::UnknownChip { id: head })
}

/// Poll byte reads at `at` until the erase-in-progress pattern clears,
/// bounded by `timeout`.
fn poll_erased(
    session: &Session,
    at: CartAddr,
    timeout: Duration,
    op: &'static str,
) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let reply = session.transact(Command::ReadByte { addr: at }, REPLY_TIMEOUT, op)?;
        let (_, value) = reply.byte_echo().ok_or(Error::Protocol("erase poll"))?;
        if value == ERASED {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout { op });
        }
        thread::sleep(ERASE_POLL_DELAY);
    }
}

fn erase_at(
    session: &Session,
    chip: &FlashChipInfo,
    target: CartAddr,
    timeout: Duration,
    op: &'static str,
) -> Result<(), Error> {
    handshake(session, target, CMD_ERASE_SECTOR, op)?;
    let poll_at = CartAddr::from_raw(target.raw() + chip.recovery_offset);
    poll_erased(session, poll_at, timeout, op)
}

/// Erase the sector that starts at `bank`.
///
/// Callers align `bank` to the chip's erase cadence. Boot-sector parts get
/// their first sector swept in 8 KiB sub-sectors instead of one unit.
pub fn erase_sector(session: &Session, chip: &FlashChipInfo, bank: u16) -> Result<(), Error> {
    if chip.erase_group > 1 && bank == 0 {
        return erase_boot_sectors(session, chip);
    }
    switch_bank(session, bank)?;
    debug!("erasing sector at bank {}", bank);
    erase_at(
        session,
        chip,
        CartAddr::banked(bank, 0),
        ERASE_SECTOR_TIMEOUT,
        "sector erase",
    )
}

/// Sweep the first sector of a boot-sector part as 8 KiB sub-sectors.
fn erase_boot_sectors(session: &Session, chip: &FlashChipInfo) -> Result<(), Error> {
    debug!("erasing first sector in {} sub-sectors", chip.erase_group);
    for group in 0..chip.erase_group as usize {
        let abs = group * BOOT_SUB_SECTOR;
        let bank = (abs / BANK_SIZE) as u16;
        let offset = (abs % BANK_SIZE) as u16;
        switch_bank(session, bank)?;
        erase_at(
            session,
            chip,
            CartAddr::banked(bank, offset),
            ERASE_SECTOR_TIMEOUT,
            "boot sector erase",
        )?;
    }
    Ok(())
}

/// Erase the whole chip.
pub fn erase_flash_all(session: &Session, chip: &FlashChipInfo) -> Result<(), Error> {
    switch_bank(session, 0)?;
    info!("erasing entire {} {} chip", chip.vendor, chip.part);
    handshake(session, CartAddr::from_raw(UNLOCK_ADDR1), CMD_ERASE_CHIP, "chip erase")?;
    poll_erased(
        session,
        CartAddr::from_raw(chip.recovery_offset),
        ERASE_CHIP_TIMEOUT,
        "chip erase",
    )
}

/// Read one 16 KiB bank.
///
/// Issues one read per offset, batched per 256-byte block, and places each
/// data byte by the address echoed in its reply rather than by arrival
/// position.
pub fn read_bank(session: &Session, bank: u16) -> Result<Vec<u8>, Error> {
    let started = Instant::now();
    switch_bank(session, bank)?;
    let mut out = vec![0u8; BANK_SIZE];
    let listener = session.listen(TAG_READ_BYTE)?;
    for block in 0..BLOCKS_PER_BANK {
        let base = (block * BLOCK_SIZE) as u16;
        let reads: Vec<Command> = (0..BLOCK_SIZE)
            .map(|i| Command::ReadByte { addr: CartAddr::banked(bank, base + i as u16) })
            .collect();
        session.send(&reads)?;
        for _ in 0..BLOCK_SIZE {
            let reply = listener.recv(REPLY_TIMEOUT, "bank read")?;
            let (offset, value) = reply.byte_echo().ok_or(Error::Protocol("bank read"))?;
            out[block * BLOCK_SIZE + offset as usize] = value;
        }
    }
    debug!("bank {} read in {:?}", bank, started.elapsed());
    Ok(out)
}

/// Program one 16 KiB bank and verify it from the write echoes.
///
/// Rejects any buffer that is not exactly one bank. Every reply is checked
/// for both address and data against the intended write; the first mismatch
/// in a block fails the call, but only after the block's remaining replies
/// have been drained so the listener queue ends the call empty.
pub fn write_bank(session: &Session, bank: u16, data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() != BANK_SIZE {
        return Err(Error::BadLength { expect: BANK_SIZE, got: data.len() });
    }
    let started = Instant::now();
    switch_bank(session, bank)?;
    let mut verified = vec![0u8; BANK_SIZE];
    let listener = session.listen(TAG_WRITE_FLASH_BYTE)?;
    for block in 0..BLOCKS_PER_BANK {
        let base = block * BLOCK_SIZE;
        let writes: Vec<Command> = (0..BLOCK_SIZE)
            .map(|i| Command::WriteFlashByte {
                addr: CartAddr::banked(bank, (base + i) as u16),
                value: data[base + i],
            })
            .collect();
        session.send(&writes)?;

        let mut mismatch: Option<Error> = None;
        for i in 0..BLOCK_SIZE {
            let reply = listener.recv(REPLY_TIMEOUT, "bank write")?;
            let (offset, value) = reply.byte_echo().ok_or(Error::Protocol("bank write"))?;
            if mismatch.is_some() {
                continue;
            }
            let addr = (base + i) as u16;
            if offset != i as u8 {
                mismatch = Some(Error::AddressMismatch {
                    bank,
                    expect: addr,
                    got: (base as u16 & 0xFF00) | offset as u16,
                });
            } else if value != data[base + i] {
                mismatch = Some(Error::DataMismatch {
                    bank,
                    addr,
                    expect: data[base + i],
                    got: value,
                });
            } else {
                verified[base + i] = value;
            }
        }
        if let Some(e) = mismatch {
            return Err(e);
        }
    }
    debug!("bank {} written and verified in {:?}", bank, started.elapsed());
    Ok(verified)
}
